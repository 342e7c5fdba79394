use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, Subcommand};

use replikv::client::Client;

#[derive(Parser, Debug)]
#[command(name = "replikv-client", about = "Command line client for replikv")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:6379")]
    addr: String,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    Ping,
    Echo {
        message: String,
    },
    Get {
        key: String,
    },
    Set {
        key: String,
        value: String,
        /// Expiry in milliseconds.
        #[arg(long)]
        px: Option<u64>,
    },
    Info,
}

#[tokio::main]
async fn main() -> replikv::Result<()> {
    let args = Args::parse();

    let mut client = Client::connect(&args.addr).await?;

    match args.command {
        Cmd::Ping => {
            println!("{}", client.ping().await?);
        }
        Cmd::Echo { message } => {
            let reply = client.echo(Bytes::from(message.into_bytes())).await?;
            println!("{}", String::from_utf8_lossy(&reply));
        }
        Cmd::Get { key } => match client.get(&key).await? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(nil)"),
        },
        Cmd::Set { key, value, px } => {
            let value = Bytes::from(value.into_bytes());

            match px {
                Some(ms) => {
                    client
                        .set_expires(&key, value, Duration::from_millis(ms))
                        .await?
                }
                None => client.set(&key, value).await?,
            }

            println!("OK");
        }
        Cmd::Info => {
            println!("{}", client.info().await?);
        }
    }

    Ok(())
}
