//! Per-conversion job context and options.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bon::Builder;
use rootcause::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::export::bom::{BomRecord, DEFAULT_ROOT_NAME};

/// Feet to metres.
pub const DEFAULT_UNIT_SCALE: f64 = 0.3048;

/// Shading requested for the export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisplayStyle {
    #[default]
    Colour,
    Realistic,
}

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    /// Include parameter groups in `extras.BIM` and publish BOM records.
    #[builder(default = true)]
    pub export_properties: bool,
    /// Key materials by their name when the host supplies one.
    #[builder(default = true)]
    pub named_materials: bool,
    /// Uniform scale on the root node.
    #[builder(default = DEFAULT_UNIT_SCALE)]
    pub unit_scale: f64,
    /// Root translation in host axes and host units. It is scaled by
    /// `unit_scale` like the geometry.
    #[builder(default)]
    pub origin_offset: [f64; 3],
    #[builder(into, default = DEFAULT_ROOT_NAME.to_string())]
    pub root_name: String,
    /// Overrides the texture library lookup.
    pub texture_library: Option<PathBuf>,
    /// Compression pool size. `None` lets the pool decide.
    pub compression_threads: Option<usize>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ExportOptions {
    /// Options for a structured export: unscaled root, and materials keyed by
    /// name only for realistic shading.
    pub fn structured(style: DisplayStyle) -> Self {
        Self::builder()
            .unit_scale(1.0)
            .named_materials(style == DisplayStyle::Realistic)
            .build()
    }

    /// Column-major matrix for node 0: swaps the host's Z-up axes to glTF's
    /// Y-up, then scales. `origin_offset` is applied before the scale.
    pub fn root_matrix(&self) -> [f32; 16] {
        let s = self.unit_scale as f32;
        let [tx, ty, tz] = self.origin_offset.map(|v| (v * self.unit_scale) as f32);
        [
            s, 0.0, 0.0, 0.0, 0.0, 0.0, -s, 0.0, 0.0, s, 0.0, 0.0, tx, tz, -ty, 1.0,
        ]
    }
}

/// Cooperative cancellation flag shared between a job and its controller.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Everything one conversion needs to know about its request.
///
/// One job drives one builder; running jobs one at a time is the caller's
/// business.
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub file_id: i64,
    pub output_path: PathBuf,
    pub options: ExportOptions,
    pub cancel: CancellationToken,
}

impl ExportJob {
    pub fn new(file_id: i64, output_path: impl Into<PathBuf>, options: ExportOptions) -> Self {
        Self {
            file_id,
            output_path: output_path.into(),
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }
}

/// Destination for structured BOM records.
pub trait StructureSink {
    /// Remove anything previously stored for `file_id`.
    fn delete_structure(&mut self, file_id: i64) -> Result<(), Report>;

    fn save_structure(&mut self, file_id: i64, records: &[BomRecord]) -> Result<(), Report>;
}

/// Stores records as `<dir>/<file_id>.structure.json`.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, file_id: i64) -> PathBuf {
        self.dir.join(format!("{file_id}.structure.json"))
    }
}

impl StructureSink for JsonFileSink {
    fn delete_structure(&mut self, file_id: i64) -> Result<(), Report> {
        let path = self.path_for(file_id);
        if path.exists() {
            std::fs::remove_file(&path).context("Failed to delete old structure data")?;
        }
        Ok(())
    }

    fn save_structure(&mut self, file_id: i64, records: &[BomRecord]) -> Result<(), Report> {
        std::fs::create_dir_all(&self.dir).context("Failed to create structure directory")?;
        let text = serde_json::to_string(records).context("Failed to serialize BOM records")?;
        std::fs::write(self.path_for(file_id), text).context("Failed to write structure data")?;
        Ok(())
    }
}

/// Replace the stored structure for `job` with `records`.
///
/// Skipped when the job does not export properties. Failures are logged and
/// reported as `false`; they never fail the export.
pub fn publish_structure(
    sink: &mut dyn StructureSink,
    job: &ExportJob,
    records: &[BomRecord],
) -> bool {
    if !job.options.export_properties {
        return false;
    }
    if let Err(e) = sink.delete_structure(job.file_id) {
        warn!("could not delete structure for file {}: {e}", job.file_id);
        return false;
    }
    match sink.save_structure(job.file_id, records) {
        Ok(()) => {
            info!("published {} BOM records for file {}", records.len(), job.file_id);
            true
        }
        Err(e) => {
            warn!("could not save structure for file {}: {e}", job.file_id);
            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_flat_export() {
        let options = ExportOptions::default();
        assert!(options.export_properties);
        assert!(options.named_materials);
        assert_eq!(options.unit_scale, DEFAULT_UNIT_SCALE);
        assert_eq!(options.root_name, DEFAULT_ROOT_NAME);

        let parsed: ExportOptions = serde_json::from_str(r#"{"export_properties":false}"#).unwrap();
        assert!(!parsed.export_properties);
        assert_eq!(parsed.unit_scale, DEFAULT_UNIT_SCALE);
    }

    #[test]
    fn structured_names_materials_only_when_realistic() {
        assert!(ExportOptions::structured(DisplayStyle::Realistic).named_materials);
        assert!(!ExportOptions::structured(DisplayStyle::Colour).named_materials);
        assert_eq!(ExportOptions::structured(DisplayStyle::Colour).unit_scale, 1.0);
    }

    #[test]
    fn root_matrix_swaps_axes() {
        let options = ExportOptions::builder()
            .unit_scale(2.0)
            .origin_offset([1.0, 2.0, 3.0])
            .build();
        let m = options.root_matrix();
        assert_eq!(&m[0..4], &[2.0, 0.0, 0.0, 0.0]);
        assert_eq!(&m[4..8], &[0.0, 0.0, -2.0, 0.0]);
        assert_eq!(&m[8..12], &[0.0, 2.0, 0.0, 0.0]);
        assert_eq!(&m[12..16], &[2.0, 6.0, -4.0, 1.0]);
    }

    #[test]
    fn origin_offset_is_in_host_units() {
        let options = ExportOptions::builder()
            .origin_offset([10.0, 0.0, 0.0])
            .build();
        let m = options.root_matrix();
        let x = (10.0 * DEFAULT_UNIT_SCALE) as f32;
        assert_eq!(&m[12..16], &[x, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn cancellation_is_shared() {
        let job = ExportJob::new(1, "out.glb", ExportOptions::default());
        let controller = job.cancel.clone();
        assert!(!job.is_canceled());
        controller.cancel();
        assert!(job.is_canceled());
    }

    struct FailingSink;

    impl StructureSink for FailingSink {
        fn delete_structure(&mut self, _: i64) -> Result<(), Report> {
            Ok(())
        }

        fn save_structure(&mut self, _: i64, _: &[BomRecord]) -> Result<(), Report> {
            Err(rootcause::report!("storage offline"))
        }
    }

    #[test]
    fn sink_failures_are_not_fatal() {
        let job = ExportJob::new(3, "out.glb", ExportOptions::default());
        assert!(!publish_structure(&mut FailingSink, &job, &[]));
    }

    #[test]
    fn json_sink_replaces_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonFileSink::new(dir.path());
        let job = ExportJob::new(11, "out.glb", ExportOptions::default());
        let record = BomRecord {
            file_id: 11,
            name: "L1-Walls-Basic-200".into(),
            element_id: 5,
            category: "Walls".into(),
            type_name: "200".into(),
            attributes: Vec::new(),
        };
        assert!(publish_structure(&mut sink, &job, &[record.clone(), record.clone()]));
        assert!(publish_structure(&mut sink, &job, &[record]));

        let text = std::fs::read_to_string(sink.path_for(11)).unwrap();
        let records: Vec<BomRecord> = serde_json::from_str(&text).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].type_name, "200");
        let raw: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(raw[0]["type"], "200");
    }

    #[test]
    fn publishing_skipped_without_properties() {
        let options = ExportOptions::builder().export_properties(false).build();
        let job = ExportJob::new(3, "out.glb", options);
        assert!(!publish_structure(&mut FailingSink, &job, &[]));
    }
}
