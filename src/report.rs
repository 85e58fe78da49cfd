//! Error subsets and image panels for the test split
//!
//! Three subsets are reported: correct predictions, large errors, and the
//! single sample with the maximal error. Subsets may overlap. Each subset
//! becomes a panel whose tiles are captioned with the sample ID, its index in
//! the test split, and its absolute error.

use std::fmt;
use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ReportConfig;
use crate::data::ManifestRecord;
use crate::error::{Error, Result};
use crate::evaluation::Predictions;

/// Sample indices selected by prediction error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSubsets {
    /// Absolute error per sample
    pub errors: Vec<f64>,
    /// Indices with error below the correct threshold
    pub correct: Vec<usize>,
    /// Indices with error at or above the large-error threshold
    pub large: Vec<usize>,
    /// First index attaining the maximal error
    pub max_index: usize,
}

impl ErrorSubsets {
    /// Select subsets from paired predictions
    pub fn select(predictions: &Predictions, correct_threshold: f64, large_threshold: f64) -> Result<Self> {
        let errors = predictions.absolute_errors();
        if errors.is_empty() {
            return Err(Error::invalid_input("Cannot select error subsets without samples"));
        }

        let correct = errors
            .iter()
            .enumerate()
            .filter(|(_, e)| **e < correct_threshold)
            .map(|(i, _)| i)
            .collect();
        let large = errors
            .iter()
            .enumerate()
            .filter(|(_, e)| **e >= large_threshold)
            .map(|(i, _)| i)
            .collect();

        let mut max_index = 0;
        for (i, &e) in errors.iter().enumerate() {
            if e > errors[max_index] {
                max_index = i;
            }
        }

        Ok(Self {
            errors,
            correct,
            large,
            max_index,
        })
    }

    /// The maximal error
    pub fn max_error(&self) -> f64 {
        self.errors[self.max_index]
    }
}

/// One captioned image in a panel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelTile {
    /// Index in the test split
    pub index: usize,
    /// Sample identifier
    pub id: String,
    /// Image file name
    pub filename: String,
    /// Absolute error
    pub error: f64,
}

impl fmt::Display for PanelTile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID: {}\nIndex: {}\nError: {:.4}", self.id, self.index, self.error)
    }
}

/// Which subset a panel shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PanelKind {
    CorrectPredictions,
    LargeErrors,
    MaximalError,
}

impl PanelKind {
    /// Panel heading
    pub fn title(&self) -> &'static str {
        match self {
            PanelKind::CorrectPredictions => "Correct Predictions",
            PanelKind::LargeErrors => "Large Errors",
            PanelKind::MaximalError => "Maximal Prediction Error",
        }
    }

    /// Output file stem
    pub fn file_stem(&self) -> &'static str {
        match self {
            PanelKind::CorrectPredictions => "correct_predictions",
            PanelKind::LargeErrors => "large_errors",
            PanelKind::MaximalError => "maximal_error",
        }
    }
}

/// A titled row of captioned tiles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Panel {
    pub kind: PanelKind,
    pub tiles: Vec<PanelTile>,
}

/// Everything the reporter produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub subsets: ErrorSubsets,
    pub panels: Vec<Panel>,
    /// PNG files written, if a panel directory was configured
    pub written: Vec<PathBuf>,
}

/// Builds error subsets and renders their panels
#[derive(Debug, Clone)]
pub struct Reporter {
    config: ReportConfig,
    image_dir: PathBuf,
}

impl Reporter {
    /// Create a reporter reading source images from `image_dir`
    pub fn new(config: ReportConfig, image_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            image_dir: image_dir.into(),
        }
    }

    /// Select subsets, log captions, and write panels when configured.
    ///
    /// `records` are the test records in prediction order.
    pub fn report(&self, records: &[ManifestRecord], predictions: &Predictions) -> Result<Report> {
        if records.len() != predictions.len() {
            return Err(Error::invalid_input(format!(
                "{} test records for {} predictions",
                records.len(),
                predictions.len()
            )));
        }

        let subsets = ErrorSubsets::select(
            predictions,
            self.config.correct_threshold,
            self.config.large_error_threshold,
        )?;
        info!(
            "{} correct predictions (error < {}), {} large errors (error >= {}), maximal error {:.4} at index {}",
            subsets.correct.len(),
            self.config.correct_threshold,
            subsets.large.len(),
            self.config.large_error_threshold,
            subsets.max_error(),
            subsets.max_index
        );

        let panels = self.panels(&subsets, records);
        let mut written = Vec::new();

        for panel in &panels {
            if panel.tiles.is_empty() {
                warn!("No samples for panel '{}'", panel.kind.title());
                continue;
            }

            info!("{} ({} images)", panel.kind.title(), panel.tiles.len());
            for tile in &panel.tiles {
                info!("{}", tile.to_string().replace('\n', ", "));
            }

            if let Some(dir) = &self.config.panel_dir {
                written.push(self.write_panel(panel, dir)?);
            }
        }

        Ok(Report {
            subsets,
            panels,
            written,
        })
    }

    /// Build the three panels in reporting order
    pub fn panels(&self, subsets: &ErrorSubsets, records: &[ManifestRecord]) -> Vec<Panel> {
        let tiles = |indices: &[usize]| -> Vec<PanelTile> {
            indices
                .iter()
                .filter_map(|&index| {
                    records.get(index).map(|record| PanelTile {
                        index,
                        id: record.id().to_string(),
                        filename: record.filename.clone(),
                        error: subsets.errors[index],
                    })
                })
                .collect()
        };

        vec![
            Panel {
                kind: PanelKind::CorrectPredictions,
                tiles: tiles(&subsets.correct),
            },
            Panel {
                kind: PanelKind::LargeErrors,
                tiles: tiles(&subsets.large),
            },
            Panel {
                kind: PanelKind::MaximalError,
                tiles: tiles(&[subsets.max_index]),
            },
        ]
    }

    /// Render a panel as a horizontal montage of its source images
    pub fn render(&self, panel: &Panel) -> Result<RgbImage> {
        let size = self.config.tile_size;
        let mut montage = RgbImage::new(size * panel.tiles.len() as u32, size);

        for (slot, tile) in panel.tiles.iter().enumerate() {
            let path = self.image_dir.join(&tile.filename);
            let source = image::open(&path)?.to_rgb8();
            let resized = imageops::resize(&source, size, size, FilterType::Triangle);
            imageops::replace(&mut montage, &resized, i64::from(size) * slot as i64, 0);
        }
        Ok(montage)
    }

    /// Write the montage PNG and a caption file next to it
    fn write_panel(&self, panel: &Panel, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;

        let image_path = dir.join(format!("{}.png", panel.kind.file_stem()));
        self.render(panel)?.save(&image_path)?;

        let captions = std::iter::once(panel.kind.title().to_string())
            .chain(panel.tiles.iter().map(|t| t.to_string()))
            .collect::<Vec<_>>()
            .join("\n\n");
        std::fs::write(dir.join(format!("{}.txt", panel.kind.file_stem())), captions)?;

        debug!("Wrote panel {}", image_path.display());
        Ok(image_path)
    }
}
