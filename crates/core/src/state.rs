//! Parameter restoration as an explicit merge.
//!
//! Policy for a checkpoint `incoming` applied to the live parameters:
//!
//! * key in both, same shape → overwritten (`loaded`)
//! * key only live → keeps its current initialisation (`missing`)
//! * key only in the checkpoint → ignored (`unexpected`)
//! * key in both, different shape → kept, reported (`mismatched`)
//!
//! A strict request that would not be an exact match is refused with an
//! error before anything is written.

use std::collections::HashMap;

use anyhow::{bail, Context};
use candle_core::{Tensor, Var};

/// Outcome of [`merge_state_dict`]. Key lists are sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub mismatched: Vec<String>,
}

impl LoadReport {
    /// Every live key was restored and nothing was left over.
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }

    pub fn log(&self, what: &str) {
        tracing::info!(
            loaded = self.loaded.len(),
            missing = self.missing.len(),
            unexpected = self.unexpected.len(),
            mismatched = self.mismatched.len(),
            "restored {what}"
        );
        for key in &self.mismatched {
            tracing::warn!(key = key.as_str(), "shape mismatch, keeping current value");
        }
    }
}

/// Merge `incoming` into `params` following the module-level policy.
pub fn merge_state_dict(
    params: &[(String, Var)],
    incoming: &HashMap<String, Tensor>,
    strict: bool,
) -> anyhow::Result<LoadReport> {
    let mut report = LoadReport::default();
    let mut updates = Vec::new();

    for (name, var) in params {
        match incoming.get(name) {
            None => report.missing.push(name.clone()),
            Some(t) if t.dims() != var.dims() => report.mismatched.push(name.clone()),
            Some(t) => {
                report.loaded.push(name.clone());
                updates.push((name, var, t));
            }
        }
    }
    let live: std::collections::HashSet<&str> = params.iter().map(|(n, _)| n.as_str()).collect();
    report.unexpected = incoming
        .keys()
        .filter(|k| !live.contains(k.as_str()))
        .cloned()
        .collect();

    report.loaded.sort();
    report.missing.sort();
    report.unexpected.sort();
    report.mismatched.sort();

    if strict && !report.is_exact() {
        bail!(
            "strict load refused: {} missing, {} unexpected, {} mismatched (first: {:?})",
            report.missing.len(),
            report.unexpected.len(),
            report.mismatched.len(),
            report
                .missing
                .iter()
                .chain(&report.unexpected)
                .chain(&report.mismatched)
                .next()
        );
    }

    for (name, var, t) in updates {
        let value = t
            .to_dtype(var.dtype())
            .and_then(|t| t.to_device(var.device()))
            .with_context(|| format!("convert parameter {name}"))?;
        var.set(&value)
            .with_context(|| format!("restore parameter {name}"))?;
    }
    Ok(report)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn params() -> Vec<(String, Var)> {
        let dev = Device::Cpu;
        vec![
            ("a".to_string(), Var::new(&[0f32, 0.0], &dev).unwrap()),
            ("b".to_string(), Var::new(&[0f32, 0.0, 0.0], &dev).unwrap()),
            ("c".to_string(), Var::new(&[7f32], &dev).unwrap()),
        ]
    }

    #[test]
    fn partial_merge_follows_policy() {
        let dev = Device::Cpu;
        let live = params();
        let mut incoming = HashMap::new();
        incoming.insert("a".to_string(), Tensor::new(&[1f32, 2.0], &dev).unwrap());
        incoming.insert("b".to_string(), Tensor::new(&[1f32, 2.0], &dev).unwrap());
        incoming.insert("z".to_string(), Tensor::new(&[9f32], &dev).unwrap());

        let report = merge_state_dict(&live, &incoming, false).unwrap();
        assert_eq!(report.loaded, vec!["a"]);
        assert_eq!(report.missing, vec!["c"]);
        assert_eq!(report.unexpected, vec!["z"]);
        assert_eq!(report.mismatched, vec!["b"]);
        assert!(!report.is_exact());

        assert_eq!(live[0].1.to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);
        assert_eq!(live[1].1.to_vec1::<f32>().unwrap(), vec![0.0, 0.0, 0.0]);
        assert_eq!(live[2].1.to_vec1::<f32>().unwrap(), vec![7.0]);
    }

    #[test]
    fn strict_mismatch_is_an_error_and_writes_nothing() {
        let dev = Device::Cpu;
        let live = params();
        let mut incoming = HashMap::new();
        incoming.insert("a".to_string(), Tensor::new(&[5f32, 5.0], &dev).unwrap());

        let err = merge_state_dict(&live, &incoming, true).unwrap_err();
        assert!(err.to_string().contains("strict load refused"));
        assert_eq!(live[0].1.to_vec1::<f32>().unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn strict_exact_match_succeeds() {
        let dev = Device::Cpu;
        let live = params();
        let incoming: HashMap<String, Tensor> = live
            .iter()
            .map(|(n, v)| (n.clone(), v.as_tensor().affine(1.0, 1.0).unwrap()))
            .collect();
        let report = merge_state_dict(&live, &incoming, true).unwrap();
        assert!(report.is_exact());
        assert_eq!(live[2].1.to_vec1::<f32>().unwrap(), vec![8.0]);
    }
}
