//! Pass specifications and pipeline configuration.
//!
//! A [`PassSpec`] has a textual form used on the command line, in JSON
//! configuration files and in reports: `bogus(10%)`, `flatten(cycles=2)`,
//! `subst(50%)`, `strenc`, `anti`, `sym`. Aliases are accepted on input; the
//! canonical form is always written back out.

use crate::flatten::Flatten;
use crate::opaque_predicate::OpaquePredicate;
use crate::string_encryption::StringEncryption;
use crate::substitution::Substitution;
use crate::symbol_rename::SymbolRename;
use crate::util::Transform;
use serde::{Deserialize, Serialize};
use shroud_core::encoder::EmitOptions;
use shroud_utils::errors::ConfigError;
use shroud_verification::VerificationConfig;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Bogus percentage used by level presets and a bare `bogus`.
pub const DEFAULT_BOGUS_PERCENT: u8 = 30;
/// Substitution percentage of a bare `subst`.
pub const DEFAULT_SUBST_PERCENT: u8 = 100;
/// Flattening cycles of a bare `flatten`.
pub const DEFAULT_CYCLES: u8 = 1;
/// Upper bound for `flatten(cycles=n)`.
pub const MAX_CYCLES: u8 = 4;
/// Highest `--level`.
pub const MAX_LEVEL: u8 = 4;

/// One pass of the pipeline with its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PassSpec {
    /// Opaque-predicate guards in front of `percent`% of eligible blocks.
    Bogus { percent: u8 },
    /// Dispatch-loop flattening, repeated `cycles` times.
    Flatten { cycles: u8 },
    /// Instruction substitution at `percent`% of eligible sites.
    Subst { percent: u8 },
    StringEncrypt,
    AntiDebug,
    SymbolRename,
}

impl PassSpec {
    /// Canonical pass name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Bogus { .. } => "bogus",
            Self::Flatten { .. } => "flatten",
            Self::Subst { .. } => "subst",
            Self::StringEncrypt => "strenc",
            Self::AntiDebug => "anti",
            Self::SymbolRename => "sym",
        }
    }

    /// Checks parameter ranges and feature availability.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidParameter {
            pass: self.name().to_string(),
            reason,
        };
        match *self {
            Self::Bogus { percent } | Self::Subst { percent } if percent > 100 => {
                Err(invalid(format!("percentage {percent} is above 100")))
            }
            Self::Flatten { cycles } if cycles == 0 || cycles > MAX_CYCLES => Err(invalid(format!(
                "cycles must be between 1 and {MAX_CYCLES}, got {cycles}"
            ))),
            Self::AntiDebug if !cfg!(feature = "anti-debug") => Err(ConfigError::FeatureDisabled {
                pass: self.name().to_string(),
                feature: "anti-debug".to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Instantiates the transform for this spec.
    pub fn transform(&self) -> Result<Box<dyn Transform>, ConfigError> {
        self.validate()?;
        Ok(match *self {
            Self::Bogus { percent } => Box::new(OpaquePredicate::new(percent)),
            Self::Flatten { cycles } => Box::new(Flatten::new(cycles)),
            Self::Subst { percent } => Box::new(Substitution::new(percent)),
            Self::StringEncrypt => Box::new(StringEncryption),
            Self::SymbolRename => Box::new(SymbolRename),
            #[cfg(feature = "anti-debug")]
            Self::AntiDebug => Box::new(crate::anti_debug::AntiDebug),
            #[cfg(not(feature = "anti-debug"))]
            Self::AntiDebug => {
                return Err(ConfigError::FeatureDisabled {
                    pass: self.name().to_string(),
                    feature: "anti-debug".to_string(),
                });
            }
        })
    }
}

impl fmt::Display for PassSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bogus { percent } => write!(f, "bogus({percent}%)"),
            Self::Flatten { cycles } => write!(f, "flatten(cycles={cycles})"),
            Self::Subst { percent } => write!(f, "subst({percent}%)"),
            other => f.write_str(other.name()),
        }
    }
}

fn parse_percent(pass: &str, arg: &str) -> Result<u8, ConfigError> {
    let value = arg
        .strip_prefix("percent=")
        .or_else(|| arg.strip_prefix("pct="))
        .unwrap_or(arg);
    let value = value.strip_suffix('%').unwrap_or(value).trim();
    value.parse::<u8>().map_err(|_| ConfigError::InvalidParameter {
        pass: pass.to_string(),
        reason: format!("`{arg}` is not a percentage"),
    })
}

fn parse_cycles(arg: &str) -> Result<u8, ConfigError> {
    let value = arg.strip_prefix("cycles=").unwrap_or(arg).trim();
    value.parse::<u8>().map_err(|_| ConfigError::InvalidParameter {
        pass: "flatten".to_string(),
        reason: format!("`{arg}` is not a cycle count"),
    })
}

impl FromStr for PassSpec {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim();
        let (name, arg) = match text.split_once('(') {
            Some((name, rest)) => {
                let arg = rest.strip_suffix(')').ok_or_else(|| ConfigError::InvalidParameter {
                    pass: name.trim().to_string(),
                    reason: format!("unbalanced parentheses in `{text}`"),
                })?;
                (name.trim(), Some(arg.trim()))
            }
            None => (text, None),
        };
        let spec = match name.to_ascii_lowercase().as_str() {
            "bogus" | "bcf" => Self::Bogus {
                percent: arg
                    .map(|a| parse_percent("bogus", a))
                    .transpose()?
                    .unwrap_or(DEFAULT_BOGUS_PERCENT),
            },
            "flatten" | "cfla" | "fla" => Self::Flatten {
                cycles: arg.map(parse_cycles).transpose()?.unwrap_or(DEFAULT_CYCLES),
            },
            "subst" | "sub" => Self::Subst {
                percent: arg
                    .map(|a| parse_percent("subst", a))
                    .transpose()?
                    .unwrap_or(DEFAULT_SUBST_PERCENT),
            },
            simple @ ("strenc" | "str" | "anti" | "antidebug" | "sym" | "rename") => {
                if let Some(arg) = arg.filter(|a| !a.is_empty()) {
                    return Err(ConfigError::InvalidParameter {
                        pass: simple.to_string(),
                        reason: format!("takes no parameters, got `{arg}`"),
                    });
                }
                match simple {
                    "strenc" | "str" => Self::StringEncrypt,
                    "anti" | "antidebug" => Self::AntiDebug,
                    _ => Self::SymbolRename,
                }
            }
            _ => return Err(ConfigError::UnknownPass(name.to_string())),
        };
        spec.validate()?;
        Ok(spec)
    }
}

impl TryFrom<String> for PassSpec {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PassSpec> for String {
    fn from(spec: PassSpec) -> Self {
        spec.to_string()
    }
}

/// Parses a comma-separated pass order such as `bogus(10%),flatten(cycles=1)`.
pub fn parse_pass_order(text: &str) -> Result<Vec<PassSpec>, ConfigError> {
    let mut passes = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (at, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                passes.push(text[start..at].parse()?);
                start = at + 1;
            }
            _ => {}
        }
    }
    let last = text[start..].trim();
    if !last.is_empty() || !passes.is_empty() {
        passes.push(last.parse()?);
    }
    check_duplicates(&passes)?;
    Ok(passes)
}

fn check_duplicates(passes: &[PassSpec]) -> Result<(), ConfigError> {
    for (index, pass) in passes.iter().enumerate() {
        if passes[..index].iter().any(|p| p.name() == pass.name()) {
            return Err(ConfigError::DuplicatePass(pass.name().to_string()));
        }
    }
    Ok(())
}

/// Passes of an obfuscation level.
///
/// | level | passes |
/// |---|---|
/// | 0 | none |
/// | 1 | `subst` |
/// | 2 | `subst`, `bogus` |
/// | 3 | `subst`, `bogus`, `flatten` |
/// | 4 | `strenc`, `subst`, `bogus`, `flatten`, `sym` |
///
/// Substitution goes first because it needs dead flags, which the dispatcher
/// of a flattened function keeps alive across every edge.
pub fn level_passes(level: u8) -> Result<Vec<PassSpec>, ConfigError> {
    let bogus = PassSpec::Bogus {
        percent: DEFAULT_BOGUS_PERCENT,
    };
    let flatten = PassSpec::Flatten {
        cycles: DEFAULT_CYCLES,
    };
    let subst = PassSpec::Subst {
        percent: DEFAULT_SUBST_PERCENT,
    };
    Ok(match level {
        0 => Vec::new(),
        1 => vec![subst],
        2 => vec![subst, bogus],
        3 => vec![subst, bogus, flatten],
        4 => vec![PassSpec::StringEncrypt, subst, bogus, flatten, PassSpec::SymbolRename],
        other => return Err(ConfigError::InvalidLevel(other)),
    })
}

/// Everything a run needs. Built once, then shared read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Passes in the order they run.
    pub passes: Vec<PassSpec>,
    /// 0 picks a time-derived seed at run start.
    pub seed: u64,
    /// Level the pass list came from, when it came from one.
    pub level: Option<u8>,
    /// Run the verifier after every pass instead of only at the end.
    pub verify_each_pass: bool,
    /// Emitter options.
    pub emit: EmitOptions,
    /// Verifier settings.
    pub verification: VerificationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            passes: Vec::new(),
            seed: 0,
            level: None,
            verify_each_pass: false,
            emit: EmitOptions::default(),
            verification: VerificationConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Configuration running the passes of `level`.
    pub fn from_level(level: u8) -> Result<Self, ConfigError> {
        Ok(Self {
            passes: level_passes(level)?,
            level: Some(level),
            ..Self::default()
        })
    }

    /// Reads a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::File {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Checks pass parameters, duplicates and the verification settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for pass in &self.passes {
            pass.validate()?;
        }
        check_duplicates(&self.passes)?;
        if let Some(level) = self.level.filter(|l| *l > MAX_LEVEL) {
            return Err(ConfigError::InvalidLevel(level));
        }
        self.verification
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Applies `--string-encrypt`. `explicit` tells whether the pass list was
    /// given verbatim rather than taken from a level preset.
    pub fn set_string_encryption(&mut self, enable: bool, explicit: bool) -> Result<(), ConfigError> {
        let present = self.passes.contains(&PassSpec::StringEncrypt);
        match (enable, present) {
            (true, false) => self.passes.push(PassSpec::StringEncrypt),
            (false, true) if explicit => {
                return Err(ConfigError::Conflict(
                    "--string-encrypt false contradicts `strenc` in --pass-order".to_string(),
                ));
            }
            (false, true) => self.passes.retain(|p| *p != PassSpec::StringEncrypt),
            _ => {}
        }
        Ok(())
    }

    /// Overrides the cycle count of the scheduled `flatten` pass.
    pub fn set_cycles(&mut self, cycles: u8) -> Result<(), ConfigError> {
        let spec = self
            .passes
            .iter_mut()
            .find(|p| matches!(p, PassSpec::Flatten { .. }))
            .ok_or_else(|| ConfigError::Conflict("--cycles given but `flatten` is not scheduled".into()))?;
        *spec = PassSpec::Flatten { cycles };
        spec.validate()
    }

    /// Overrides the percentage of the scheduled `bogus` pass.
    pub fn set_bogus_percent(&mut self, percent: u8) -> Result<(), ConfigError> {
        let spec = self
            .passes
            .iter_mut()
            .find(|p| matches!(p, PassSpec::Bogus { .. }))
            .ok_or_else(|| {
                ConfigError::Conflict("--bogus-percent given but `bogus` is not scheduled".into())
            })?;
        *spec = PassSpec::Bogus { percent };
        spec.validate()
    }

    /// Flattening cycles, when `flatten` is scheduled.
    pub fn cycles(&self) -> Option<u8> {
        self.passes.iter().find_map(|p| match p {
            PassSpec::Flatten { cycles } => Some(*cycles),
            _ => None,
        })
    }

    /// Bogus percentage, when `bogus` is scheduled.
    pub fn bogus_percent(&self) -> Option<u8> {
        self.passes.iter().find_map(|p| match p {
            PassSpec::Bogus { percent } => Some(*percent),
            _ => None,
        })
    }

    /// Whether string encryption is among the passes.
    pub fn string_encryption(&self) -> bool {
        self.passes.contains(&PassSpec::StringEncrypt)
    }
}
