//! Image enumeration.
//!
//! Walks the configured phase directories under the dataset root and
//! produces a deterministic, ordered list of [`ImageRecord`]s. Files whose
//! extension is not on the allow-list are skipped with a log line; a
//! declared phase directory that does not exist aborts the run.

use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::models::config::DatasetConfig;
use crate::models::error::EnumerationError;
use crate::models::record::{ImageFormat, ImageRecord};

/// Enumerate all images in the dataset, sorted by phase label then by path.
pub fn enumerate_images(config: &DatasetConfig) -> Result<Vec<ImageRecord>, EnumerationError> {
    if !config.root.is_dir() {
        return Err(EnumerationError::RootMissing(config.root.clone()));
    }
    if config.phases.is_empty() {
        return Err(EnumerationError::NoPhases);
    }

    let mut records = Vec::new();

    for phase in &config.phases {
        let dir = config.root.join(&phase.dir);
        if !dir.is_dir() {
            return Err(EnumerationError::PhaseDirMissing {
                dir: phase.dir.clone(),
                label: phase.label.clone(),
                root: config.root.clone(),
            });
        }

        let before = records.len();
        collect_dir(&dir, &phase.label, &config.extensions, &mut records)?;
        debug!(
            phase = %phase.label,
            count = records.len() - before,
            "enumerated phase directory"
        );
    }

    // Stable order makes runs reproducible and checkpoint diffs readable.
    records.sort_by(|a, b| {
        a.phase_label
            .cmp(&b.phase_label)
            .then_with(|| a.path.cmp(&b.path))
    });

    info!(total = records.len(), "image enumeration complete");
    Ok(records)
}

fn collect_dir(
    dir: &Path,
    label: &str,
    extensions: &[String],
    out: &mut Vec<ImageRecord>,
) -> Result<(), EnumerationError> {
    let entries = fs::read_dir(dir).map_err(|e| EnumerationError::ReadDir {
        path: dir.to_owned(),
        source: e,
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| EnumerationError::ReadDir {
            path: dir.to_owned(),
            source: e,
        })?;
        let path = entry.path();

        if path.is_dir() {
            collect_dir(&path, label, extensions, out)?;
            continue;
        }

        let ext = match path.extension().and_then(|e| e.to_str()) {
            Some(e) => e.to_lowercase(),
            None => {
                warn!(path = %path.display(), "skipping file without extension");
                continue;
            }
        };

        if !extensions.iter().any(|allowed| allowed == &ext) {
            warn!(path = %path.display(), "skipping non-image file");
            continue;
        }

        let format = match ImageFormat::from_extension(&ext) {
            Some(f) => f,
            None => {
                warn!(path = %path.display(), ext = %ext, "unrecognized image extension");
                continue;
            }
        };

        let size_bytes = entry
            .metadata()
            .map_err(|e| EnumerationError::ReadDir {
                path: path.clone(),
                source: e,
            })?
            .len();

        out.push(ImageRecord {
            path,
            phase_label: label.to_string(),
            format,
            size_bytes,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config::PhaseDir;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn dataset(root: &Path, phases: &[(&str, &str)]) -> DatasetConfig {
        DatasetConfig {
            root: root.to_owned(),
            phases: phases
                .iter()
                .map(|(dir, label)| PhaseDir {
                    dir: dir.to_string(),
                    label: label.to_string(),
                })
                .collect(),
            extensions: vec!["jpg".into(), "png".into()],
        }
    }

    fn touch(path: &Path) {
        File::create(path).unwrap().write_all(b"xx").unwrap();
    }

    #[test]
    fn enumerates_sorted_by_label_then_path() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("Meta")).unwrap();
        fs::create_dir(tmp.path().join("Lab")).unwrap();
        touch(&tmp.path().join("Meta/b.jpg"));
        touch(&tmp.path().join("Meta/a.jpg"));
        touch(&tmp.path().join("Lab/z.png"));

        let config = dataset(tmp.path(), &[("Meta", "metastable"), ("Lab", "labile")]);
        let records = enumerate_images(&config).unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].phase_label, "labile");
        assert!(records[1].path.ends_with("a.jpg"));
        assert!(records[2].path.ends_with("b.jpg"));
    }

    #[test]
    fn missing_phase_dir_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let config = dataset(tmp.path(), &[("Nope", "labile")]);
        assert!(matches!(
            enumerate_images(&config),
            Err(EnumerationError::PhaseDirMissing { .. })
        ));
    }

    #[test]
    fn skips_non_image_files() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("Lab")).unwrap();
        touch(&tmp.path().join("Lab/notes.txt"));
        touch(&tmp.path().join("Lab/ok.jpg"));

        let config = dataset(tmp.path(), &[("Lab", "labile")]);
        let records = enumerate_images(&config).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].path.ends_with("ok.jpg"));
    }

    #[test]
    fn recurses_into_subdirectories() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("Lab/batch_02")).unwrap();
        touch(&tmp.path().join("Lab/batch_02/deep.png"));

        let config = dataset(tmp.path(), &[("Lab", "labile")]);
        let records = enumerate_images(&config).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].phase_label, "labile");
    }
}
