use std::io;
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;

/// Seam for running external commands so callers can substitute a fake in
/// tests instead of spawning real processes.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> io::Result<Output> {
        command.output().await
    }
}
