use clap::Parser;
use rustdis_client::{Client, Command, Config, Error, Frame};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(about = "Send one command to the server and print the reply")]
struct Args {
    /// Server URL, e.g. redis://:password@127.0.0.1:6379/0. Overrides host, port, database and
    /// password.
    #[arg(short, long, env = "RUSTDIS_URL")]
    url: Option<String>,

    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    #[arg(short, long, default_value_t = 6379)]
    port: u16,

    /// Database number
    #[arg(short = 'n', long, default_value_t = 0)]
    database: u32,

    #[arg(short = 'a', long, env = "RUSTDIS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// The command and its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let args = Args::parse();

    let config = match &args.url {
        Some(url) => Config::from_url(url)?,
        None => {
            let config = Config::new(args.host.as_str(), args.port).database(args.database);
            match &args.password {
                Some(password) => config.password(password.as_str()),
                None => config,
            }
        }
    };

    let mut parts = args.command.iter();
    let command = match parts.next() {
        Some(verb) => Command::new(verb).args(parts),
        None => return Err(Error::Config("missing command".to_string())),
    };

    let client = Client::new(config);
    let reply = client.context().query::<Frame>(command).await?;

    print!("{}", render(&reply, 0));

    Ok(())
}

// Mirrors the layout of redis-cli.
fn render(frame: &Frame, indent: usize) -> String {
    match frame {
        Frame::Simple(s) => format!("{s}\n"),
        Frame::Error(e) => format!("(error) {e}\n"),
        Frame::Integer(i) => format!("(integer) {i}\n"),
        Frame::Bulk(bytes) => format!("\"{}\"\n", String::from_utf8_lossy(bytes)),
        Frame::Null => "(nil)\n".to_string(),
        Frame::Array(items) if items.is_empty() => "(empty array)\n".to_string(),
        Frame::Array(items) => {
            let width = items.len().to_string().len();
            items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    let prefix = format!("{:>width$}) ", i + 1);
                    let pad = if i == 0 { 0 } else { indent };
                    format!(
                        "{}{}{}",
                        " ".repeat(pad),
                        prefix,
                        render(item, indent + prefix.len())
                    )
                })
                .collect()
        }
    }
}
