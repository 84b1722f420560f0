//! Hardware capability probe for the accelerated execution backend.
//!
//! One-shot, cached for the life of the process: the answer cannot change
//! without a restart. The probe never fails — any error or panic during
//! capability negotiation is downgraded to `false` — and it never blocks or
//! alters session behavior; the UI layer only uses it to decide whether to
//! show a compatibility warning, and the registry to pick a fallback device.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::log_warn;

type ProbeQuery = Arc<dyn Fn() -> Result<bool, String> + Send + Sync>;

pub struct AcceleratorProbe {
    query: ProbeQuery,
    cached: OnceCell<bool>,
}

impl AcceleratorProbe {
    /// Probe the real host hardware.
    pub fn new() -> Self {
        Self::with_query(Arc::new(detect_accelerator))
    }

    /// Probe through an injected query; for tests and embedders with their
    /// own capability negotiation.
    pub fn with_query(query: ProbeQuery) -> Self {
        Self {
            query,
            cached: OnceCell::new(),
        }
    }

    /// Whether the host supports the accelerated backend. Safe to call any
    /// number of times; the query runs at most once.
    pub async fn probe(&self) -> bool {
        *self
            .cached
            .get_or_init(|| async {
                let query = self.query.clone();
                match tokio::task::spawn_blocking(move || query()).await {
                    Ok(Ok(supported)) => supported,
                    Ok(Err(e)) => {
                        log_warn!("accelerator probe failed: {e}");
                        false
                    }
                    Err(e) => {
                        log_warn!("accelerator probe panicked: {e}");
                        false
                    }
                }
            })
            .await
    }
}

impl Default for AcceleratorProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Best-effort host check: Metal ships with macOS; elsewhere look for an
/// NVIDIA driver (device nodes, then nvidia-smi).
fn detect_accelerator() -> Result<bool, String> {
    if cfg!(target_os = "macos") {
        return Ok(true);
    }

    if Path::new("/dev/nvidia0").exists() || Path::new("/dev/nvidiactl").exists() {
        return Ok(true);
    }

    match Command::new("nvidia-smi").arg("-L").output() {
        Ok(output) => Ok(output.status.success() && !output.stdout.is_empty()),
        Err(_) => Ok(false),
    }
}
