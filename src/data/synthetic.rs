//! Seeded synthetic digitizer traces.
//!
//! Two flavours:
//!
//! - calibration traces: one isolated pulse per trace at a uniformly random
//!   sub-sample phase (what the template builder expects)
//! - analysis events: per-channel traces with one pulse and an optional
//!   pile-up partner, packaged as `EventRecord`s
//!
//! Everything is driven by `StdRng::seed_from_u64`, so a seed fully determines
//! the output.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;

use crate::domain::Polarity;
use crate::error::AppError;
use crate::io::events::{DigitizerEvent, EventRecord};

/// Analytic pulse shape, peaking at `t = 0` with height 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PulseShape {
    Gaussian { sigma: f64 },
    /// Different widths on the rising and falling edges.
    SplitGaussian { rise: f64, fall: f64 },
}

impl PulseShape {
    pub fn eval(&self, t: f64) -> f64 {
        let width = match *self {
            Self::Gaussian { sigma } => sigma,
            Self::SplitGaussian { rise, .. } if t < 0.0 => rise,
            Self::SplitGaussian { fall, .. } => fall,
        };
        let z = t / width;
        (-0.5 * z * z).exp()
    }

    /// Integral over the real line.
    pub fn area(&self) -> f64 {
        match *self {
            Self::Gaussian { sigma } => sigma * (2.0 * PI).sqrt(),
            Self::SplitGaussian { rise, fall } => (rise + fall) * (PI / 2.0).sqrt(),
        }
    }

    fn validate(&self) -> Result<(), AppError> {
        let ok = match *self {
            Self::Gaussian { sigma } => sigma.is_finite() && sigma > 0.0,
            Self::SplitGaussian { rise, fall } => {
                rise.is_finite() && fall.is_finite() && rise > 0.0 && fall > 0.0
            }
        };
        if ok {
            Ok(())
        } else {
            Err(AppError::config(format!("invalid pulse shape {self:?}")))
        }
    }
}

/// Parameters for a batch of single-pulse calibration traces.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSpec {
    pub n_traces: usize,
    pub trace_length: usize,
    pub baseline: f64,
    /// Pulse height in ADC counts.
    pub amplitude: f64,
    pub noise_sigma: f64,
    /// Nominal peak position; each trace adds a phase drawn from `[-0.5, 0.5)`.
    pub peak_position: f64,
    pub polarity: Polarity,
}

/// One pulse placed in a trace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InjectedPulse {
    pub time: f64,
    /// Height in ADC counts, always positive; polarity decides the direction.
    pub amplitude: f64,
}

/// Shared noise source for trace rendering.
struct TraceRenderer<'a> {
    shape: &'a PulseShape,
    noise: Normal<f64>,
    polarity: Polarity,
}

impl<'a> TraceRenderer<'a> {
    fn new(shape: &'a PulseShape, noise_sigma: f64, polarity: Polarity) -> Result<Self, AppError> {
        shape.validate()?;
        let noise = Normal::new(0.0, noise_sigma)
            .map_err(|e| AppError::config(format!("noise distribution: {e}")))?;
        Ok(Self {
            shape,
            noise,
            polarity,
        })
    }

    fn render(&self, rng: &mut StdRng, len: usize, baseline: f64, pulses: &[InjectedPulse]) -> Vec<u16> {
        let sign = self.polarity.sign();
        (0..len)
            .map(|i| {
                let signal: f64 = pulses
                    .iter()
                    .map(|p| p.amplitude * self.shape.eval(i as f64 - p.time))
                    .sum();
                let v = baseline + sign * signal + self.noise.sample(rng);
                v.round().clamp(0.0, f64::from(u16::MAX)) as u16
            })
            .collect()
    }
}

/// Render pulses on a flat baseline with Gaussian noise, rounded to ADC counts.
pub fn render_trace(
    shape: &PulseShape,
    len: usize,
    baseline: f64,
    pulses: &[InjectedPulse],
    noise_sigma: f64,
    polarity: Polarity,
    seed: u64,
) -> Result<Vec<u16>, AppError> {
    let renderer = TraceRenderer::new(shape, noise_sigma, polarity)?;
    let mut rng = StdRng::seed_from_u64(seed);
    Ok(renderer.render(&mut rng, len, baseline, pulses))
}

/// Generate single-pulse calibration traces.
pub fn calibration_traces(
    shape: &PulseShape,
    spec: &CalibrationSpec,
    seed: u64,
) -> Result<Vec<Vec<u16>>, AppError> {
    if spec.n_traces == 0 || spec.trace_length == 0 {
        return Err(AppError::config("calibration traces need a positive count and length"));
    }
    let renderer = TraceRenderer::new(shape, spec.noise_sigma, spec.polarity)?;
    let mut rng = StdRng::seed_from_u64(seed);

    let traces = (0..spec.n_traces)
        .map(|_| {
            let phase: f64 = rng.gen_range(-0.5..0.5);
            let pulse = InjectedPulse {
                time: spec.peak_position + phase,
                amplitude: spec.amplitude,
            };
            renderer.render(&mut rng, spec.trace_length, spec.baseline, &[pulse])
        })
        .collect();
    Ok(traces)
}

/// Parameters for a run of synthetic analysis events.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationSpec {
    pub n_events: usize,
    pub start_entry: u64,
    pub branch_name: String,
    pub channels: usize,
    pub trace_length: usize,
    pub baseline: f64,
    pub amplitude_min: f64,
    pub amplitude_max: f64,
    pub noise_sigma: f64,
    /// Nominal peak sample; each pulse jitters uniformly by up to ±2 samples.
    pub peak_position: f64,
    /// Chance that a channel carries a second, later pulse.
    pub pileup_probability: f64,
    pub polarity: Polarity,
    /// Device clock ticks between consecutive events.
    pub clock_period: u64,
}

impl SimulationSpec {
    fn validate(&self) -> Result<(), AppError> {
        if self.channels == 0 || self.trace_length == 0 {
            return Err(AppError::config("simulation needs channels and a trace length"));
        }
        if !(self.amplitude_min > 0.0 && self.amplitude_max >= self.amplitude_min) {
            return Err(AppError::config("invalid simulated amplitude range"));
        }
        if !(0.0..=1.0).contains(&self.pileup_probability) {
            return Err(AppError::config("pile-up probability must be in [0, 1]"));
        }
        Ok(())
    }
}

/// Generate analysis events. The injected pulses are returned alongside so
/// callers can compare fits against the truth.
pub fn simulate_events(
    shape: &PulseShape,
    spec: &SimulationSpec,
    seed: u64,
) -> Result<Vec<(EventRecord, Vec<Vec<InjectedPulse>>)>, AppError> {
    spec.validate()?;
    let renderer = TraceRenderer::new(shape, spec.noise_sigma, spec.polarity)?;
    let mut rng = StdRng::seed_from_u64(seed);

    let mut out = Vec::with_capacity(spec.n_events);
    for n in 0..spec.n_events {
        let clock = n as u64 * spec.clock_period;
        let mut channels = Vec::with_capacity(spec.channels);
        let mut truth = Vec::with_capacity(spec.channels);
        for _ in 0..spec.channels {
            let mut pulses = vec![InjectedPulse {
                time: spec.peak_position + rng.gen_range(-2.0..2.0),
                amplitude: rng.gen_range(spec.amplitude_min..=spec.amplitude_max),
            }];
            if rng.gen_bool(spec.pileup_probability) {
                pulses.push(InjectedPulse {
                    time: pulses[0].time + rng.gen_range(4.0..10.0),
                    amplitude: rng.gen_range(spec.amplitude_min..=spec.amplitude_max),
                });
            }
            channels.push(renderer.render(&mut rng, spec.trace_length, spec.baseline, &pulses));
            truth.push(pulses);
        }

        let event = DigitizerEvent {
            system_clock: clock,
            device_clocks: vec![clock; spec.channels],
            channels,
        };
        let record = EventRecord {
            entry: spec.start_entry + n as u64,
            digitizers: BTreeMap::from([(spec.branch_name.clone(), event)]),
        };
        out.push((record, truth));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn shapes_peak_at_zero_with_unit_height() {
        let g = PulseShape::Gaussian { sigma: 1.5 };
        assert_approx_eq!(g.eval(0.0), 1.0);
        assert!(g.eval(0.5) < 1.0);
        let s = PulseShape::SplitGaussian { rise: 1.0, fall: 3.0 };
        assert_approx_eq!(s.eval(-1.0), (-0.5f64).exp());
        assert_approx_eq!(s.eval(3.0), (-0.5f64).exp());
        // Sampled sum approximates the area for smooth shapes.
        let sum: f64 = (-20..=30).map(|i| s.eval(i as f64)).sum();
        assert!((sum - s.area()).abs() / s.area() < 0.02);
    }

    #[test]
    fn calibration_traces_are_reproducible() {
        let shape = PulseShape::Gaussian { sigma: 2.0 };
        let spec = CalibrationSpec {
            n_traces: 5,
            trace_length: 64,
            baseline: 1500.0,
            amplitude: 800.0,
            noise_sigma: 3.0,
            peak_position: 30.0,
            polarity: Polarity::Negative,
        };
        let a = calibration_traces(&shape, &spec, 9).unwrap();
        let b = calibration_traces(&shape, &spec, 9).unwrap();
        assert_eq!(a, b);
        for t in &a {
            assert_eq!(t.len(), 64);
            let min = t.iter().copied().min().unwrap();
            assert!(min < 800, "negative pulse should dip well below baseline");
        }
    }

    #[test]
    fn simulation_produces_one_trace_per_channel() {
        let spec = SimulationSpec {
            n_events: 3,
            start_entry: 10,
            branch_name: "caen_0".into(),
            channels: 4,
            trace_length: 128,
            baseline: 200.0,
            amplitude_min: 500.0,
            amplitude_max: 2000.0,
            noise_sigma: 2.0,
            peak_position: 50.0,
            pileup_probability: 1.0,
            polarity: Polarity::Positive,
            clock_period: 100,
        };
        let events = simulate_events(&PulseShape::Gaussian { sigma: 1.5 }, &spec, 1).unwrap();
        assert_eq!(events.len(), 3);
        let (record, truth) = &events[2];
        assert_eq!(record.entry, 12);
        let event = &record.digitizers["caen_0"];
        assert_eq!(event.channels.len(), 4);
        assert_eq!(event.system_clock, 200);
        assert!(truth.iter().all(|pulses| pulses.len() == 2));
    }
}
