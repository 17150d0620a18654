use std::{error::Error, time::Duration};

use clap::{Parser, Subcommand};
use skein::{Client, ClientConfig, Message, OpCode};

#[derive(Parser)]
#[command(version, about = "Send requests to a skein server", long_about = None)]
struct Cli {
    /// Server address; repeat to spread requests round-robin
    #[arg(long = "addr", default_value = "127.0.0.1:3320")]
    addrs: Vec<String>,
    /// Maximum connections per address
    #[arg(long, default_value_t = 4)]
    max_conn: usize,
    /// Dial and pool wait timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    dial_timeout: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Ping,
    Put {
        dmap: String,
        key: String,
        value: String,
    },
    Get {
        dmap: String,
        key: String,
    },
    Delete {
        dmap: String,
        key: String,
    },
    /// Open a stream and print the first `count` pushed messages
    Stream {
        #[arg(default_value_t = 1)]
        count: usize,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    let config = ClientConfig::new(cli.addrs, cli.max_conn)
        .with_dial_timeout(Duration::from_millis(cli.dial_timeout));
    let client = Client::new(config)?;

    let req = match cli.command {
        Command::Ping => Message::dmap(OpCode::Ping),
        Command::Put { dmap, key, value } => {
            Message::dmap(OpCode::Put).with_key(dmap, key).with_body(value)
        }
        Command::Get { dmap, key } => Message::dmap(OpCode::Get).with_key(dmap, key),
        Command::Delete { dmap, key } => Message::dmap(OpCode::Delete).with_key(dmap, key),
        Command::Stream { count } => {
            let mut channel = client.create_stream(&Message::stream(OpCode::CreateStream))?;
            println!("stream {} open", channel.id());
            for message in channel.messages().take(count) {
                let message = message?;
                println!(
                    "{:?}: {}",
                    message.op(),
                    String::from_utf8_lossy(message.body())
                );
            }
            channel.close()?;
            client.close();
            return Ok(());
        }
    };

    let resp = client.request(&req)?;
    println!("{:?}", resp.status());
    if !resp.body().is_empty() {
        println!("{}", String::from_utf8_lossy(resp.body()));
    }
    client.close();
    Ok(())
}
