//! JSON configuration.
//!
//! Two files:
//!
//! - the fit configuration: digitizers, their detectors and a
//!   `defaultDetector` block every detector inherits from
//! - the template-builder configuration: binning and gates for calibration
//!
//! Everything is validated here, once, so the per-event code can rely on the
//! fit window fitting inside every trace.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::{FitConfiguration, Polarity, Tuning};
use crate::error::AppError;
use crate::template::TemplateBuilderConfig;

/// Channels and samples of a CAEN V1742 readout.
pub const CAEN_1742_CHANNELS: usize = 32;
pub const CAEN_1742_TRACE_LEN: usize = 1024;

/// Detector keys that may come from `defaultDetector` or the detector itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorSettings {
    pub template_buffer: Option<usize>,
    pub template_length: Option<usize>,
    pub fit_length: Option<usize>,
    pub peak_index: Option<usize>,
    pub wiggle_room: Option<u32>,
    pub neg_polarity: Option<bool>,
    pub draw: Option<bool>,
}

impl DetectorSettings {
    /// Per-key override: values set here win over `defaults`.
    pub fn or(&self, defaults: &DetectorSettings) -> DetectorSettings {
        DetectorSettings {
            template_buffer: self.template_buffer.or(defaults.template_buffer),
            template_length: self.template_length.or(defaults.template_length),
            fit_length: self.fit_length.or(defaults.fit_length),
            peak_index: self.peak_index.or(defaults.peak_index),
            wiggle_room: self.wiggle_room.or(defaults.wiggle_room),
            neg_polarity: self.neg_polarity.or(defaults.neg_polarity),
            draw: self.draw.or(defaults.draw),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorEntry {
    pub name: String,
    pub channel: usize,
    pub template_file: PathBuf,
    #[serde(flatten)]
    pub settings: DetectorSettings,
}

/// Supported digitizer hardware, tagged by `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DigitizerKind {
    #[serde(rename = "caen1742")]
    Caen1742,
    #[serde(rename = "custom")]
    Custom {
        channels: usize,
        #[serde(rename = "traceLength")]
        trace_length: usize,
    },
}

impl DigitizerKind {
    pub fn channels(&self) -> usize {
        match *self {
            Self::Caen1742 => CAEN_1742_CHANNELS,
            Self::Custom { channels, .. } => channels,
        }
    }

    pub fn trace_len(&self) -> usize {
        match *self {
            Self::Caen1742 => CAEN_1742_TRACE_LEN,
            Self::Custom { trace_length, .. } => trace_length,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigitizerEntry {
    #[serde(flatten)]
    pub kind: DigitizerKind,
    pub branch_name: String,
    #[serde(default)]
    pub detectors: Vec<DetectorEntry>,
}

/// Fit configuration as written on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FitConfigFile {
    #[serde(default)]
    pub template_base_dir: PathBuf,
    #[serde(default)]
    pub start_entry: u64,
    #[serde(default)]
    pub default_detector: DetectorSettings,
    pub digitizers: Vec<DigitizerEntry>,
    #[serde(default)]
    pub tuning: Tuning,
}

/// One detector after inheritance and validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDetector {
    pub config: FitConfiguration,
    pub template_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDigitizer {
    pub kind: DigitizerKind,
    pub branch_name: String,
    pub detectors: Vec<ResolvedDetector>,
}

/// Validated, immutable run configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub start_entry: u64,
    pub digitizers: Vec<ResolvedDigitizer>,
    pub tuning: Tuning,
}

impl RunConfig {
    /// Read, resolve and validate a fit configuration file.
    ///
    /// A relative `templateBaseDir` is taken relative to the file's directory.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let file: FitConfigFile = read_json(path, "fit configuration")?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        file.resolve(base)
    }

    pub fn detectors(&self) -> impl Iterator<Item = (&ResolvedDigitizer, &ResolvedDetector)> {
        self.digitizers
            .iter()
            .flat_map(|d| d.detectors.iter().map(move |det| (d, det)))
    }

    pub fn detector(&self, name: &str) -> Option<(&ResolvedDigitizer, &ResolvedDetector)> {
        self.detectors().find(|(_, det)| det.config.name == name)
    }
}

impl FitConfigFile {
    pub fn resolve(&self, relative_to: &Path) -> Result<RunConfig, AppError> {
        validate_tuning(&self.tuning)?;
        let base_dir = if self.template_base_dir.is_absolute() {
            self.template_base_dir.clone()
        } else {
            relative_to.join(&self.template_base_dir)
        };

        let mut names = BTreeSet::new();
        let mut digitizers = Vec::with_capacity(self.digitizers.len());
        for dig in &self.digitizers {
            if let DigitizerKind::Custom { channels, trace_length } = dig.kind {
                if channels == 0 || trace_length == 0 {
                    return Err(AppError::config(format!(
                        "digitizer '{}' needs positive channels and traceLength",
                        dig.branch_name
                    )));
                }
            }
            let mut detectors = Vec::with_capacity(dig.detectors.len());
            for entry in &dig.detectors {
                if !names.insert(entry.name.as_str()) {
                    return Err(AppError::config(format!("detector '{}' is defined twice", entry.name)));
                }
                let config = resolve_detector(entry, &self.default_detector)?;
                validate_detector(&config, &dig.kind)?;
                detectors.push(ResolvedDetector {
                    config,
                    template_path: base_dir.join(&entry.template_file),
                });
            }
            digitizers.push(ResolvedDigitizer {
                kind: dig.kind,
                branch_name: dig.branch_name.clone(),
                detectors,
            });
        }

        Ok(RunConfig {
            start_entry: self.start_entry,
            digitizers,
            tuning: self.tuning,
        })
    }
}

fn require<T>(value: Option<T>, key: &str, detector: &str) -> Result<T, AppError> {
    value.ok_or_else(|| {
        AppError::config(format!(
            "'{key}' missing for detector '{detector}' and in defaultDetector"
        ))
    })
}

fn resolve_detector(entry: &DetectorEntry, defaults: &DetectorSettings) -> Result<FitConfiguration, AppError> {
    let s = entry.settings.or(defaults);
    let name = entry.name.as_str();
    Ok(FitConfiguration {
        name: entry.name.clone(),
        channel: entry.channel,
        template_buffer: require(s.template_buffer, "templateBuffer", name)?,
        template_length: require(s.template_length, "templateLength", name)?,
        fit_length: require(s.fit_length, "fitLength", name)?,
        peak_index: require(s.peak_index, "peakIndex", name)?,
        wiggle_room: require(s.wiggle_room, "wiggleRoom", name)?,
        polarity: Polarity::from_negative_flag(require(s.neg_polarity, "negPolarity", name)?),
        draw: s.draw.unwrap_or(false),
    })
}

fn validate_detector(c: &FitConfiguration, kind: &DigitizerKind) -> Result<(), AppError> {
    let fail = |msg: String| Err(AppError::config(format!("detector '{}': {msg}", c.name)));
    if c.name.is_empty() || c.name.contains(|ch: char| ch == ',' || ch == '"' || ch.is_control()) {
        return fail("names must be non-empty and free of commas, quotes and control characters".into());
    }
    if c.channel >= kind.channels() {
        return fail(format!("channel {} but the digitizer has {}", c.channel, kind.channels()));
    }
    if c.fit_length > kind.trace_len() {
        return fail(format!("fitLength {} exceeds the trace length {}", c.fit_length, kind.trace_len()));
    }
    if c.peak_index < 1 || c.peak_index + 2 > c.fit_length {
        return fail(format!(
            "peakIndex {} must satisfy 1 <= peakIndex <= fitLength - 2 (fitLength {})",
            c.peak_index, c.fit_length
        ));
    }
    if c.template_buffer >= c.template_length {
        return fail(format!(
            "templateBuffer {} must be smaller than templateLength {}",
            c.template_buffer, c.template_length
        ));
    }
    Ok(())
}

fn validate_tuning(t: &Tuning) -> Result<(), AppError> {
    let positive = |v: f64| v.is_finite() && v > 0.0;
    if t.fitter.max_iterations == 0 || !positive(t.fitter.tolerance) || !positive(t.fitter.max_step) {
        return Err(AppError::config("fitter tuning needs positive maxIterations, tolerance and maxStep"));
    }
    let e = &t.escalation;
    if !positive(e.chi2_threshold) || !positive(e.two_pulse_chi2_threshold) {
        return Err(AppError::config("escalation thresholds must be finite and positive"));
    }
    if e.two_pulse_chi2_threshold < e.chi2_threshold {
        return Err(AppError::config(format!(
            "twoPulseChi2Threshold ({}) is below chi2Threshold ({})",
            e.two_pulse_chi2_threshold, e.chi2_threshold
        )));
    }
    if t.peak_gate.min > t.peak_gate.max {
        return Err(AppError::config(format!(
            "peak gate min {} exceeds max {}",
            t.peak_gate.min, t.peak_gate.max
        )));
    }
    Ok(())
}

fn default_amplitude_bins() -> usize {
    1000
}

fn default_min_bin_entries() -> usize {
    10
}

/// Template-builder configuration as written on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateConfigFile {
    pub n_bins_pseudo_time: usize,
    pub n_time_bins: usize,
    pub baseline_fit_length: usize,
    pub min_peak: u16,
    #[serde(default = "default_amplitude_bins")]
    pub amplitude_bins: usize,
    #[serde(default = "default_min_bin_entries")]
    pub min_bin_entries: usize,
}

impl TemplateConfigFile {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        read_json(path, "template configuration")
    }

    /// Combine with a detector's resolved settings.
    pub fn builder_config(&self, detector: &FitConfiguration) -> Result<TemplateBuilderConfig, AppError> {
        let config = TemplateBuilderConfig {
            channel: detector.channel,
            template_length: detector.template_length,
            buffer_zone: detector.template_buffer,
            n_bins_pseudo_time: self.n_bins_pseudo_time,
            n_time_bins: self.n_time_bins,
            baseline_fit_length: self.baseline_fit_length,
            min_peak: self.min_peak,
            polarity: detector.polarity,
            amplitude_bins: self.amplitude_bins,
            min_bin_entries: self.min_bin_entries,
        };
        config.validate()?;
        Ok(config)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &'static str) -> Result<T, AppError> {
    let text = fs::read_to_string(path).map_err(|e| AppError::io(path, e))?;
    serde_json::from_str(&text).map_err(|e| AppError::format(what, format!("{}: {e}", path.display())))
}
