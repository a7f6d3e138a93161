use event_driven_server::{
    EventLoop, FsContentProvider, ServerConfig, ServerResult, ShutdownToken,
};
use log::info;
use std::env;
use std::path::Path;

fn main() -> ServerResult<()> {
    env_logger::init();

    // An optional single argument names a JSON configuration file
    let args: Vec<String> = env::args().collect();
    let config = if args.len() > 1 && Path::new(&args[1]).exists() {
        ServerConfig::from_json_file(&args[1])?
    } else {
        ServerConfig::new()
    };

    let shutdown = ShutdownToken::new();
    let token = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("received shutdown signal, stopping server");
        token.trigger();
    })
    .expect("Error setting Ctrl-C handler");

    let provider = FsContentProvider::new(config.document_root.clone());
    let mut event_loop = EventLoop::new(config, Box::new(provider))?;

    event_loop.run(&shutdown)
}
