use tracing::Level;

pub fn log_command(level: Level, msg: &str, cmd: &str) {
    if level == Level::ERROR {
        tracing::error!(cmd = %cmd, "{msg}");
    } else if level == Level::WARN {
        tracing::warn!(cmd = %cmd, "{msg}");
    } else if level == Level::INFO {
        tracing::info!(cmd = %cmd, "{msg}");
    } else if level == Level::DEBUG {
        tracing::debug!(cmd = %cmd, "{msg}");
    } else {
        tracing::trace!(cmd = %cmd, "{msg}");
    }
}
