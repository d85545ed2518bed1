use std::path::PathBuf;

use tempocast::config::Settings;
use tempocast::server;
use tempocast::state::AppState;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings_path = std::env::args().nth(1).map(PathBuf::from);
    let settings = match Settings::load(settings_path.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };

    let state = AppState::new(settings);
    if let Err(e) = server::serve(state).await {
        log::error!("Server failed: {e}");
        std::process::exit(1);
    }
}
