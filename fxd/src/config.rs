use std::env;
use std::path::PathBuf;

use serde::Deserialize;

/// Daemon settings read from `fxd.toml`, looked up in the working
/// directory and then the XDG config dirs. The file only seeds FXD_*
/// variables that are not already set, so the environment and CLI flags
/// keep precedence.
#[derive(Deserialize)]
struct Config {
    socket: Option<PathBuf>,
    ring_capacity: Option<u32>,
}

pub fn apply() {
    let Some((path, config)) = locate() else {
        return;
    };
    log::info!("applying config from {}", path.display());

    seed_env("FXD_SOCKET", config.socket.map(|p| p.display().to_string()));
    seed_env("FXD_RING_CAPACITY", config.ring_capacity.map(|c| c.to_string()));
}

fn locate() -> Option<(PathBuf, Config)> {
    let local = Some(PathBuf::from("fxd.toml"));
    let xdg = xdg::BaseDirectories::new()
        .ok()
        .and_then(|dirs| dirs.find_config_file("fxd.toml"));

    for path in [local, xdg].into_iter().flatten() {
        let Ok(contents) = std::fs::read_to_string(&path) else {
            continue;
        };
        match toml::from_str(&contents) {
            Ok(config) => return Some((path, config)),
            Err(e) => {
                log::error!("unreadable config {}: {e}", path.display());
                std::process::exit(1);
            }
        }
    }

    None
}

fn seed_env(name: &str, value: Option<String>) {
    if env::var_os(name).is_some() {
        return;
    }
    if let Some(value) = value {
        env::set_var(name, value);
    }
}
