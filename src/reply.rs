use bytes::Bytes;

use crate::frame::Frame;
use crate::{Error, Result};

/// Conversion of a decoded reply into the result type a caller expects.
///
/// An error reply, or a reply of another shape, becomes [`Error::ResultMismatch`]. Only
/// [`Frame`] itself accepts every reply, error replies included.
pub trait FromFrame: Sized {
    fn from_frame(frame: Frame) -> Result<Self>;
}

impl FromFrame for Frame {
    fn from_frame(frame: Frame) -> Result<Self> {
        Ok(frame)
    }
}

/// Status replies such as `+OK`.
impl FromFrame for () {
    fn from_frame(frame: Frame) -> Result<Self> {
        match frame {
            Frame::Simple(_) => Ok(()),
            frame => Err(Error::mismatch("status", frame)),
        }
    }
}

impl FromFrame for i64 {
    fn from_frame(frame: Frame) -> Result<Self> {
        match frame {
            Frame::Integer(i) => Ok(i),
            frame => Err(Error::mismatch("integer", frame)),
        }
    }
}

impl FromFrame for bool {
    fn from_frame(frame: Frame) -> Result<Self> {
        match frame {
            Frame::Integer(i) => Ok(i != 0),
            frame => Err(Error::mismatch("integer", frame)),
        }
    }
}

impl FromFrame for Bytes {
    fn from_frame(frame: Frame) -> Result<Self> {
        match frame {
            Frame::Bulk(bytes) => Ok(bytes),
            Frame::Simple(s) => Ok(Bytes::from(s)),
            frame => Err(Error::mismatch("bulk string", frame)),
        }
    }
}

impl FromFrame for String {
    fn from_frame(frame: Frame) -> Result<Self> {
        match frame {
            Frame::Simple(s) => Ok(s),
            Frame::Bulk(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(s) => Ok(s),
                Err(_) => Err(Error::mismatch("UTF-8 string", Frame::Bulk(bytes))),
            },
            frame => Err(Error::mismatch("string", frame)),
        }
    }
}

/// `Null` maps to `None`; anything else must convert to `T`.
impl<T: FromFrame> FromFrame for Option<T> {
    fn from_frame(frame: Frame) -> Result<Self> {
        match frame {
            Frame::Null => Ok(None),
            frame => T::from_frame(frame).map(Some),
        }
    }
}

impl<T: FromFrame> FromFrame for Vec<T> {
    fn from_frame(frame: Frame) -> Result<Self> {
        match frame {
            Frame::Array(items) => items.into_iter().map(T::from_frame).collect(),
            Frame::Null => Ok(Vec::new()),
            frame => Err(Error::mismatch("array", frame)),
        }
    }
}
