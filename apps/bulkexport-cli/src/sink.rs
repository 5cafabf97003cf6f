use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};

use bulkexport_core::types::Batch;
use bulkexport_stream::BatchSink;

/// Writes hit ids one per line. A batch counts as written once it is flushed.
pub struct IdFileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    spinner: ProgressBar,
    written: u64,
}

impl IdFileSink {
    pub async fn create(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = File::create(path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {pos} hits {msg}")?,
        );
        spinner.set_message(path.display().to_string());
        spinner.enable_steady_tick(Duration::from_millis(120));
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            spinner,
            written: 0,
        })
    }

    /// Flush, stop the spinner and return the number of ids written.
    pub async fn finish(mut self) -> anyhow::Result<u64> {
        self.writer
            .flush()
            .await
            .with_context(|| format!("flushing {}", self.path.display()))?;
        self.spinner
            .finish_with_message(format!("wrote {}", self.path.display()));
        Ok(self.written)
    }
}

impl BatchSink for IdFileSink {
    async fn write_batch(&mut self, batch: &Batch) -> anyhow::Result<()> {
        let mut lines = String::with_capacity(batch.len() * 24);
        for id in batch.ids() {
            lines.push_str(id);
            lines.push('\n');
        }
        self.writer
            .write_all(lines.as_bytes())
            .await
            .with_context(|| format!("writing {}", self.path.display()))?;
        self.writer
            .flush()
            .await
            .with_context(|| format!("flushing {}", self.path.display()))?;
        self.written += batch.len() as u64;
        self.spinner.set_position(self.written);
        Ok(())
    }
}
