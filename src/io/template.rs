//! Read/write template JSON files.
//!
//! A template file is the portable form of one channel's calibration:
//! - build metadata (tool, creation time, detector, builder parameters)
//! - named interpolants (`mean`, `sigma`, `realTime`) as knot tables with
//!   their domain
//! - build diagnostics
//!
//! Loading looks interpolants up by name, so extra entries are ignored.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Polarity;
use crate::error::AppError;
use crate::math::{CubicSpline, Knots, LinearInterpolant};
use crate::template::{BuildDiagnostics, Template, TemplateBuild, TemplateBuilderConfig};

pub const MEAN: &str = "mean";
pub const SIGMA: &str = "sigma";
pub const REAL_TIME: &str = "realTime";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpolantKind {
    Cubic,
    Linear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedInterpolant {
    pub kind: InterpolantKind,
    /// `[lo, hi]` over which the interpolant is meaningful.
    pub domain: [f64; 2],
    pub knots: Knots,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuilderParameters {
    pub channel: usize,
    pub template_length: usize,
    pub template_buffer: usize,
    pub n_bins_pseudo_time: usize,
    pub n_time_bins: usize,
    pub baseline_fit_length: usize,
    pub min_peak: u16,
    pub polarity: Polarity,
}

impl From<&TemplateBuilderConfig> for BuilderParameters {
    fn from(c: &TemplateBuilderConfig) -> Self {
        Self {
            channel: c.channel,
            template_length: c.template_length,
            template_buffer: c.buffer_zone,
            n_bins_pseudo_time: c.n_bins_pseudo_time,
            n_time_bins: c.n_time_bins,
            baseline_fit_length: c.baseline_fit_length,
            min_peak: c.min_peak,
            polarity: c.polarity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateFile {
    pub tool: String,
    pub created: DateTime<Utc>,
    pub detector: String,
    pub parameters: BuilderParameters,
    pub interpolants: BTreeMap<String, NamedInterpolant>,
    #[serde(default)]
    pub diagnostics: BuildDiagnostics,
}

impl TemplateFile {
    pub fn from_build(detector: &str, config: &TemplateBuilderConfig, build: &TemplateBuild) -> Self {
        let (lo, hi) = build.template.domain();
        let interpolants = BTreeMap::from([
            (
                MEAN.to_string(),
                NamedInterpolant {
                    kind: InterpolantKind::Cubic,
                    domain: [lo, hi],
                    knots: Knots::from(build.template.mean_spline()),
                },
            ),
            (
                SIGMA.to_string(),
                NamedInterpolant {
                    kind: InterpolantKind::Cubic,
                    domain: [lo, hi],
                    knots: Knots::from(build.template.sigma_spline()),
                },
            ),
            (
                REAL_TIME.to_string(),
                NamedInterpolant {
                    kind: InterpolantKind::Linear,
                    domain: [0.0, 1.0],
                    knots: Knots::from(&build.real_time),
                },
            ),
        ]);

        Self {
            tool: env!("CARGO_PKG_NAME").to_string(),
            created: Utc::now(),
            detector: detector.to_string(),
            parameters: BuilderParameters::from(config),
            interpolants,
            diagnostics: build.diagnostics.clone(),
        }
    }

    fn interpolant(&self, name: &str, kind: InterpolantKind) -> Result<&NamedInterpolant, AppError> {
        let entry = self
            .interpolants
            .get(name)
            .ok_or_else(|| AppError::config(format!("template for '{}' has no '{name}' interpolant", self.detector)))?;
        if entry.kind != kind {
            return Err(AppError::config(format!(
                "interpolant '{name}' is {:?}, expected {kind:?}",
                entry.kind
            )));
        }
        Ok(entry)
    }

    /// Rebuild the fit template from the `mean` and `sigma` knots.
    pub fn template(&self) -> Result<Template, AppError> {
        let mean = self.interpolant(MEAN, InterpolantKind::Cubic)?;
        let sigma = self.interpolant(SIGMA, InterpolantKind::Cubic)?;
        if mean.domain != sigma.domain {
            return Err(AppError::config("mean and sigma interpolants disagree on the domain"));
        }
        let [lo, hi] = mean.domain;
        Template::new(
            lo,
            hi,
            CubicSpline::new(mean.knots.x.clone(), mean.knots.y.clone())?,
            CubicSpline::new(sigma.knots.x.clone(), sigma.knots.y.clone())?,
        )
    }

    pub fn real_time(&self) -> Result<LinearInterpolant, AppError> {
        let rt = self.interpolant(REAL_TIME, InterpolantKind::Linear)?;
        LinearInterpolant::new(rt.knots.x.clone(), rt.knots.y.clone())
    }
}

/// Write a template JSON file.
pub fn write_template_json(path: &Path, file: &TemplateFile) -> Result<(), AppError> {
    let out = File::create(path).map_err(|e| AppError::io(path, e))?;
    serde_json::to_writer_pretty(BufWriter::new(out), file).map_err(|e| AppError::format("template file", e))
}

/// Read a template JSON file.
pub fn read_template_json(path: &Path) -> Result<TemplateFile, AppError> {
    let file = File::open(path).map_err(|e| AppError::io(path, e))?;
    serde_json::from_reader(std::io::BufReader::new(file)).map_err(|e| {
        AppError::format("template file", format!("{}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_build() -> (TemplateBuilderConfig, TemplateBuild) {
        let config = TemplateBuilderConfig {
            channel: 3,
            template_length: 10,
            buffer_zone: 4,
            n_bins_pseudo_time: 50,
            n_time_bins: 5,
            baseline_fit_length: 16,
            min_peak: 1500,
            polarity: Polarity::Negative,
            amplitude_bins: 1000,
            min_bin_entries: 10,
        };
        let (lo, hi) = config.domain();
        let template = Template::tabulate(lo, hi, 51, |t| (-0.5 * t * t).exp() / 2.5, |_| 0.002).unwrap();
        let real_time = LinearInterpolant::new(vec![0.0, 0.3, 1.0], vec![0.0, 0.6, 1.0]).unwrap();
        let build = TemplateBuild {
            template,
            real_time,
            diagnostics: BuildDiagnostics {
                traces_seen: 120,
                traces_used: 100,
                ..Default::default()
            },
        };
        (config, build)
    }

    #[test]
    fn json_round_trip_preserves_template() {
        let (config, build) = sample_build();
        let file = TemplateFile::from_build("calo_3", &config, &build);
        let text = serde_json::to_string(&file).unwrap();
        let back: TemplateFile = serde_json::from_str(&text).unwrap();
        assert_eq!(back.detector, "calo_3");
        assert_eq!(back.created, file.created);

        let tpl = back.template().unwrap();
        assert_eq!(tpl.domain(), (-4.5, 5.5));
        for &t in &[-3.0, -0.4, 0.0, 1.7, 5.0] {
            assert!((tpl.mean(t) - build.template.mean(t)).abs() < 1e-12);
        }
        assert!((back.real_time().unwrap().eval(0.15) - 0.3).abs() < 1e-12);
        assert_eq!(back.parameters.template_buffer, 4);
        assert_eq!(back.diagnostics.traces_used, 100);
    }

    #[test]
    fn missing_interpolant_is_a_configuration_error() {
        let (config, build) = sample_build();
        let mut file = TemplateFile::from_build("calo_3", &config, &build);
        file.interpolants.remove(SIGMA);
        assert!(matches!(file.template(), Err(AppError::Config(_))));
    }
}
