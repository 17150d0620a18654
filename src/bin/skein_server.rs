use std::{error::Error, sync::Arc, sync::mpsc, thread, time::Duration};

use clap::Parser;
use log::{info, warn};
use skein::{
    DispatchError, Message, OpCode, ResponseWriter, Server, ServerConfig, Status,
    protocol::{Extra, StreamExtra},
};

#[derive(Debug, Parser)]
#[command(version, about = "Serve the skein wire protocol with an echo dispatcher")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    bind_addr: String,
    /// Port to listen on
    #[arg(long, default_value_t = 3320)]
    bind_port: u16,
    /// Close connections idle for this many seconds (0 disables)
    #[arg(long, default_value_t = 0)]
    idle_timeout: u64,
    /// TCP keep-alive period in seconds (0 disables)
    #[arg(long, default_value_t = 300)]
    keep_alive: u64,
    /// Seconds to wait for connections to drain on Ctrl-C
    #[arg(long, default_value_t = 10)]
    grace: u64,
}

/// Answers every request with `Ok` and the request body. Streams get a
/// greeting pushed right after they open.
fn echo(w: &mut ResponseWriter, req: &Message) -> Result<(), DispatchError> {
    w.set_status(Status::Ok);
    w.set_body(req.body());

    if let Some(stream) = w.stream() {
        let greeting = Message::stream(OpCode::StreamCreated)
            .with_extra(Extra::Stream(StreamExtra {
                stream_id: stream.id(),
            }))
            .with_body(format!("stream {} ready", stream.id()));
        stream.send(greeting)?;
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ServerConfig {
        bind_addr: cli.bind_addr,
        bind_port: cli.bind_port,
        idle_timeout: Some(Duration::from_secs(cli.idle_timeout)),
        keep_alive: Some(Duration::from_secs(cli.keep_alive)),
    };

    let server = Arc::new(Server::new(config));
    server.set_dispatcher(echo)?;

    let (stop, stopped) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop.send(());
    })?;

    let serving = Arc::clone(&server);
    let listener = thread::spawn(move || serving.listen_and_serve());

    // a failed bind ends the listener thread before any signal arrives
    while stopped.recv_timeout(Duration::from_millis(200)).is_err() {
        if listener.is_finished() {
            break;
        }
    }

    info!("stopping server");
    if let Err(e) = server.shutdown(Duration::from_secs(cli.grace)) {
        warn!("{e}");
    }
    match listener.join() {
        Ok(result) => result?,
        Err(_) => return Err("listener thread panicked".into()),
    }
    Ok(())
}
