//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

fn default_import_buffer_boost() -> usize {
    2
}

fn default_export_buffer_bytes() -> usize {
    256 << 20
}

fn default_true() -> bool {
    true
}

/// Process-wide engine parameters. Everything has a sensible default, so an
/// empty JSON object is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineParams {
    /// Worker threads per rank. `None` uses the machine's parallelism.
    #[serde(default)]
    pub threads: Option<usize>,
    /// Extra headroom factor for the import side of the export buffer, for
    /// when rank import pressure exceeds export pressure.
    #[serde(default = "default_import_buffer_boost")]
    pub import_buffer_boost: usize,
    /// Fixed export-record capacity. `None` derives it from free memory;
    /// tests shrink it to force buffer-full iterations.
    #[serde(default)]
    pub bunch_size: Option<usize>,
    /// Upper bound on the memory handed to the export table when the
    /// capacity is derived from free memory.
    #[serde(default = "default_export_buffer_bytes")]
    pub export_buffer_bytes: usize,
    /// Skip the per-thread candidate buffer; for kernels using the
    /// list-free visitor.
    #[serde(default)]
    pub no_ngblist: bool,
    /// The caller vouches that active lists contain no garbage, enabling
    /// zero-copy queue adoption for filter-free walks.
    #[serde(default = "default_true")]
    pub assume_no_garbage: bool,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            threads: None,
            import_buffer_boost: default_import_buffer_boost(),
            bunch_size: None,
            export_buffer_bytes: default_export_buffer_bytes(),
            no_ngblist: false,
            assume_no_garbage: true,
        }
    }
}

impl EngineParams {
    /// Load parameters from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let text = fs::read_to_string(path.as_ref())?;
        let params: EngineParams = serde_json::from_str(&text)?;
        tracing::info!("engine parameters loaded from {}", path.as_ref().display());
        Ok(params)
    }

    /// Resolved worker-thread count.
    pub fn resolved_threads(&self) -> usize {
        self.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}
