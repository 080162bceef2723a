//! GPU assignment for server-side rendering workers
//!
//! Each GPU keeps a count of the live slots assigned to it. New SSR slots go
//! to the least-loaded GPU, ties broken by the lowest index.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GpuError {
    #[error("no GPU available")]
    NoGpuAvailable,
    #[error("GPU {0} has no assigned clients")]
    NotAssigned(u32),
}

/// Client count for one GPU, as reported in snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GpuLoad {
    pub index: u32,
    pub clients: u32,
}

#[derive(Debug)]
pub struct GpuBalancer {
    clients: Vec<u32>,
}

impl GpuBalancer {
    pub fn new(gpu_count: u32) -> Self {
        Self {
            clients: vec![0; gpu_count as usize],
        }
    }

    /// Assign the GPU with the fewest clients
    pub fn assign(&mut self) -> Result<u32, GpuError> {
        let (index, count) = self
            .clients
            .iter_mut()
            .enumerate()
            .min_by_key(|(i, c)| (**c, *i))
            .ok_or(GpuError::NoGpuAvailable)?;
        *count += 1;
        Ok(index as u32)
    }

    pub fn release(&mut self, index: u32) -> Result<(), GpuError> {
        match self.clients.get_mut(index as usize) {
            Some(count) if *count > 0 => {
                *count -= 1;
                Ok(())
            }
            _ => Err(GpuError::NotAssigned(index)),
        }
    }

    pub fn loads(&self) -> Vec<GpuLoad> {
        self.clients
            .iter()
            .enumerate()
            .map(|(i, &clients)| GpuLoad {
                index: i as u32,
                clients,
            })
            .collect()
    }
}
