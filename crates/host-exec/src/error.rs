use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    /// The remote shell itself failed (exit 255), not the command it carried.
    #[error("remote transport failure: {stderr}")]
    Transport { stderr: String },
    /// The invoked command reported failure; `output` carries stderr for
    /// local commands and stdout for remote ones.
    #[error("command failed: {output}")]
    Command { output: String },
    #[error("failed to spawn command: {0}")]
    Spawn(#[from] std::io::Error),
}
