// genotype.rs

use crate::error::{PipelineError, Result};
use log::warn;
use std::fmt;
use std::str::FromStr;

/// Highest allele index in the genotype enumeration.
pub const MAX_ALLELE: u8 = 6;

/// Number of distinct ordinal codes (unordered pairs over 0..=6).
pub const GENOTYPE_CODES: u8 = 28;

/// Outcome of encoding one genotype call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodedCall {
    Code(u8),
    Missing,
}

impl EncodedCall {
    pub fn to_f64(self) -> f64 {
        match self {
            EncodedCall::Code(code) => code as f64,
            EncodedCall::Missing => f64::NAN,
        }
    }
}

/// Ordinal of the unordered pair {a, b}: pairs are enumerated by their larger
/// allele, so 0/0=0, 0/1=1, 1/1=2, 0/2=3, ..., 6/6=27.
fn pair_ordinal(a: u8, b: u8) -> u8 {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    high * (high + 1) / 2 + low
}

fn allele_index(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'6' => Some(byte - b'0'),
        _ => None,
    }
}

/// Encodes one genotype string. Returns `None` for anything outside the
/// enumeration (including phased `a|b`, haploid calls and alleles above 6).
pub fn encode_call(call: &str) -> Option<EncodedCall> {
    match call {
        "." | "./." => return Some(EncodedCall::Missing),
        _ => {}
    }
    let bytes = call.as_bytes();
    if bytes.len() != 3 || bytes[1] != b'/' {
        return None;
    }
    let a = allele_index(bytes[0])?;
    let b = allele_index(bytes[2])?;
    Some(EncodedCall::Code(pair_ordinal(a, b)))
}

/// What to do with a genotype string the enumeration does not cover.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnencodedPolicy {
    /// Abort with `PipelineError::UnencodedGenotype`.
    #[default]
    Fail,
    /// Treat the cell as missing.
    Missing,
}

impl FromStr for UnencodedPolicy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fail" => Ok(UnencodedPolicy::Fail),
            "missing" => Ok(UnencodedPolicy::Missing),
            other => Err(PipelineError::UnsupportedKeyword {
                what: "unencoded genotype policy",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for UnencodedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnencodedPolicy::Fail => "fail",
            UnencodedPolicy::Missing => "missing",
        })
    }
}

/// Encodes rows of genotype strings under one policy, counting cells that had
/// to be treated as missing.
#[derive(Debug)]
pub struct GenotypeEncoder {
    policy: UnencodedPolicy,
    unencoded_cells: usize,
}

impl GenotypeEncoder {
    pub fn new(policy: UnencodedPolicy) -> Self {
        Self {
            policy,
            unencoded_cells: 0,
        }
    }

    /// Encodes the genotype cells of one variant row; `samples` names the cells
    /// for error reporting.
    pub fn encode_row(
        &mut self,
        variant: &str,
        samples: &[String],
        calls: &[String],
    ) -> Result<Vec<f64>> {
        let mut encoded = Vec::with_capacity(calls.len());
        for (i, call) in calls.iter().enumerate() {
            match encode_call(call) {
                Some(value) => encoded.push(value.to_f64()),
                None => match self.policy {
                    UnencodedPolicy::Fail => {
                        return Err(PipelineError::UnencodedGenotype {
                            value: call.clone(),
                            variant: variant.to_string(),
                            sample: samples.get(i).cloned().unwrap_or_else(|| i.to_string()),
                        })
                    }
                    UnencodedPolicy::Missing => {
                        self.unencoded_cells += 1;
                        encoded.push(f64::NAN);
                    }
                },
            }
        }
        Ok(encoded)
    }

    pub fn unencoded_cells(&self) -> usize {
        self.unencoded_cells
    }

    /// Logs how many cells fell outside the enumeration, if any.
    pub fn report(&self, context: &str) {
        if self.unencoded_cells > 0 {
            warn!(
                "{}: {} genotype cells outside the known set were treated as missing.",
                context, self.unencoded_cells
            );
        }
    }
}
