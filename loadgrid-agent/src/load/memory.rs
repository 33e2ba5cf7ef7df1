//! Memory ballast held in 1 MiB chunks

use super::GeneratorFault;
use tracing::{debug, warn};

const CHUNK_BYTES: usize = 1024 * 1024;
/// Fill byte; writing it touches every page so the chunk is resident
const FILL: u8 = 0xA5;

pub struct MemoryBallast {
    cap_mb: u64,
    chunks: Vec<Vec<u8>>,
}

impl MemoryBallast {
    pub fn new(cap_mb: u64) -> Self {
        Self { cap_mb, chunks: Vec::new() }
    }

    pub fn target_mb(&self, level: u8) -> u64 {
        u64::from(level.min(100)) * self.cap_mb / 100
    }

    pub fn held_mb(&self) -> u64 {
        self.chunks.len() as u64
    }

    /// Level that the held memory currently stands for
    pub fn effective_level(&self) -> u8 {
        if self.cap_mb == 0 {
            return 0;
        }
        (self.held_mb() * 100 / self.cap_mb).min(100) as u8
    }

    /// Grows or shrinks to the target of `level`.
    ///
    /// Growth yields to the runtime between chunks. On allocation failure the chunks
    /// already allocated are kept.
    pub async fn resize(&mut self, level: u8) -> Result<(), GeneratorFault> {
        let target = self.target_mb(level);
        let held = self.held_mb();

        if target <= held {
            self.chunks.truncate(target as usize);
            self.chunks.shrink_to_fit();
            debug!("Memory ballast shrunk {} -> {} MB", held, target);
            return Ok(());
        }

        while self.held_mb() < target {
            let mut chunk: Vec<u8> = Vec::new();
            if chunk.try_reserve_exact(CHUNK_BYTES).is_err() || self.chunks.try_reserve(1).is_err() {
                let fault = GeneratorFault::Allocation {
                    reached_mb: self.held_mb(),
                    target_mb: target,
                };
                warn!("{}", fault);
                return Err(fault);
            }
            chunk.resize(CHUNK_BYTES, FILL);
            self.chunks.push(chunk);
            tokio::task::yield_now().await;
        }

        debug!("Memory ballast grown {} -> {} MB", held, target);
        Ok(())
    }

    pub fn release(&mut self) {
        self.chunks = Vec::new();
    }
}
