//! Obfuscation options.
//!
//! Options come from three layers: a JSON config file, explicit driver
//! flags (which override the config only when actually given), and
//! per-function annotation strings that adjust the final decision for one
//! function. Annotation problems are diagnosed and disable the option for
//! that function; the compilation continues.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ObfuscationError;
use crate::ir::{FuncId, Linkage, Module};

/// Maximum obfuscation level.
pub const MAX_LEVEL: u32 = 3;

/// Length the random seed is padded to.
pub const RANDOM_SEED_LEN: usize = 32;

/// Global setting for one obfuscation kind.
#[derive(Debug, Clone)]
pub struct ObfOpt {
    tag: &'static str,
    enabled: bool,
    level: u32,
}

impl ObfOpt {
    /// Disabled option with level 0.
    pub const fn new(tag: &'static str) -> Self {
        ObfOpt {
            tag,
            enabled: false,
            level: 0,
        }
    }

    /// The annotation tag (`indbr`, `icall`, …).
    pub const fn tag(&self) -> &'static str {
        self.tag
    }

    /// Whether the pass is globally enabled.
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Global level, always in `0..=MAX_LEVEL`.
    pub const fn level(&self) -> u32 {
        self.level
    }

    /// Enable or disable.
    pub fn set_enable(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Set the level, clamping to [`MAX_LEVEL`].
    pub fn set_level(&mut self, level: u32) {
        self.level = level.min(MAX_LEVEL);
    }

    /// Apply an explicitly-given enable flag.
    pub fn read_flag(&mut self, enable: Option<bool>) {
        if let Some(enable) = enable {
            self.enabled = enable;
        }
    }

    /// Apply explicitly-given enable and level flags.
    pub fn read_flags(&mut self, enable: Option<bool>, level: Option<u32>) {
        self.read_flag(enable);
        if let Some(level) = level {
            self.set_level(level);
        }
    }
}

/// The resolved decision for one `(pass, function)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveOption {
    enabled: bool,
    level: u32,
}

impl EffectiveOption {
    /// Disabled, level 0.
    pub const fn disabled() -> Self {
        EffectiveOption {
            enabled: false,
            level: 0,
        }
    }

    /// Whether the pass runs on the function.
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Per-function level in `0..=MAX_LEVEL`.
    pub const fn level(&self) -> u32 {
        self.level
    }
}

/// All options of one compilation plus the random seed.
#[derive(Debug, Clone)]
pub struct ObfuscationOptions {
    ind_br: ObfOpt,
    i_call: ObfOpt,
    ind_gv: ObfOpt,
    fla: ObfOpt,
    cse: ObfOpt,
    cie: ObfOpt,
    cfe: ObfOpt,
    rtti: ObfOpt,
    random_seed: Vec<u8>,
}

/// The `{ "enable": …, "level": … }` fragment under a tag key.
#[derive(Debug, Deserialize)]
struct OptionConfig {
    enable: Option<bool>,
    level: Option<i64>,
}

impl Default for ObfuscationOptions {
    fn default() -> Self {
        ObfuscationOptions {
            ind_br: ObfOpt::new("indbr"),
            i_call: ObfOpt::new("icall"),
            ind_gv: ObfOpt::new("indgv"),
            fla: ObfOpt::new("fla"),
            cse: ObfOpt::new("cse"),
            cie: ObfOpt::new("cie"),
            cfe: ObfOpt::new("cfe"),
            rtti: ObfOpt::new("rtti"),
            random_seed: Vec::new(),
        }
    }
}

impl ObfuscationOptions {
    /// All options disabled, no seed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Indirect-branch option.
    pub const fn ind_br_opt(&self) -> &ObfOpt {
        &self.ind_br
    }

    /// Indirect-call option.
    pub const fn i_call_opt(&self) -> &ObfOpt {
        &self.i_call
    }

    /// Indirect-global-variable option.
    pub const fn ind_gv_opt(&self) -> &ObfOpt {
        &self.ind_gv
    }

    /// Control-flow-flattening option.
    pub const fn fla_opt(&self) -> &ObfOpt {
        &self.fla
    }

    /// String-encryption option (the pass itself lives outside this crate).
    pub const fn cse_opt(&self) -> &ObfOpt {
        &self.cse
    }

    /// Constant-integer-encryption option.
    pub const fn cie_opt(&self) -> &ObfOpt {
        &self.cie
    }

    /// Constant-FP-encryption option.
    pub const fn cfe_opt(&self) -> &ObfOpt {
        &self.cfe
    }

    /// RTTI-scrambler option.
    pub const fn rtti_opt(&self) -> &ObfOpt {
        &self.rtti
    }

    /// The random seed: empty, or exactly [`RANDOM_SEED_LEN`] bytes.
    pub fn random_seed(&self) -> &[u8] {
        &self.random_seed
    }

    /// Set the seed, right-padding with NUL to [`RANDOM_SEED_LEN`].
    pub fn set_random_seed<S: AsRef<[u8]>>(&mut self, seed: S) {
        let mut seed = seed.as_ref().to_vec();
        seed.resize(RANDOM_SEED_LEN, 0);
        self.random_seed = seed;
    }

    fn opt_by_tag_mut(&mut self, tag: &str) -> Option<&mut ObfOpt> {
        [
            &mut self.ind_br,
            &mut self.i_call,
            &mut self.ind_gv,
            &mut self.fla,
            &mut self.cse,
            &mut self.cie,
            &mut self.cfe,
            &mut self.rtti,
        ]
        .into_iter()
        .find(|opt| opt.tag() == tag)
    }

    /// Load options from a JSON config file. `None` yields the defaults; a
    /// missing or malformed file is fatal.
    pub fn read_config_file(path: Option<&Path>) -> Result<Self, ObfuscationError> {
        let mut result = Self::new();
        let Some(path) = path else {
            return Ok(result);
        };
        if !path.exists() {
            return Err(ObfuscationError::ConfigMissing(path.to_path_buf()));
        }
        let text = fs::read_to_string(path)?;
        let root: serde_json::Value = serde_json::from_str(&text)?;
        let Some(obj) = root.as_object() else {
            return Err(ObfuscationError::ConfigRoot);
        };

        for (key, value) in obj {
            if key == "randomSeed" {
                if let Some(seed) = value.as_str() {
                    result.set_random_seed(seed);
                }
                continue;
            }
            match result.opt_by_tag_mut(key) {
                Some(opt) => {
                    if let Ok(frag) = serde_json::from_value::<OptionConfig>(value.clone()) {
                        if let Some(enable) = frag.enable {
                            opt.set_enable(enable);
                        }
                        if let Some(level) = frag.level {
                            opt.set_level(level as u32);
                        }
                    }
                }
                None => {
                    tracing::warn!(key = key.as_str(), "unknown obfuscation config node");
                }
            }
        }
        Ok(result)
    }

    /// Resolve the effective option for one function by combining the
    /// global `option` with the function's annotations.
    pub fn to_obfuscate(&self, option: &ObfOpt, module: &Module, func: FuncId) -> EffectiveOption {
        let f = module.func(func);
        if f.is_declaration() || f.linkage == Linkage::AvailableExternally {
            return EffectiveOption::disabled();
        }

        let attr_enable = format!("+{}", option.tag());
        let attr_disable = format!("-{}", option.tag());
        let attr_level = format!("^{}", option.tag());

        let diagnose = |message: &str| {
            tracing::warn!(
                function = f.name.as_str(),
                tag = option.tag(),
                "{message}"
            );
            EffectiveOption::disabled()
        };

        let mut enable_found = false;
        let mut disable_found = false;
        let mut level_set = 0u32;
        let mut enabled = false;
        let mut level = 0u32;

        for annotation in module.annotations_for(func) {
            if annotation.contains(&attr_disable) {
                enabled = false;
                disable_found = true;
            }
            if annotation.contains(&attr_enable) {
                enabled = true;
                enable_found = true;
            }
            let Some(level_pos) = annotation.find(&attr_level) else {
                continue;
            };
            if annotation[level_pos + 1..].contains(&attr_level) {
                return diagnose("multiple level annotations for one tag");
            }
            let Some(equal_rel) = annotation[level_pos + 1..].find('=') else {
                return diagnose("level annotation is missing an equal sign");
            };
            let equal_pos = level_pos + 1 + equal_rel;
            let between = &annotation[level_pos + attr_level.len()..equal_pos];
            if between.bytes().any(|b| b != b' ') {
                return diagnose("unexpected characters before the equal sign");
            }
            let mut parsed: Option<u32> = None;
            for b in annotation[equal_pos + 1..].bytes() {
                if b == b' ' {
                    continue;
                }
                if !b.is_ascii_digit() {
                    return diagnose("level value is not a digit");
                }
                parsed = Some((b - b'0') as u32);
                break;
            }
            let Some(value) = parsed else {
                return diagnose("level value not found");
            };
            level_set += 1;
            level = value.min(MAX_LEVEL);
        }

        if disable_found && enable_found {
            return diagnose("both enable and disable annotations present");
        }
        if level_set > 1 {
            return diagnose("multiple level annotations for one tag");
        }
        if !disable_found && !enable_found {
            enabled = option.is_enabled();
        }
        if level_set == 0 {
            level = option.level();
        }
        EffectiveOption { enabled, level }
    }
}

/// Driver flags. A `Some` value means the flag was explicitly given and
/// overrides the config; `None` leaves the config value untouched.
#[derive(Debug, Clone, Default)]
pub struct PassFlags {
    /// Master switch.
    pub irobf: bool,
    /// Indirect branch.
    pub indbr: Option<bool>,
    /// Indirect-branch level.
    pub level_indbr: Option<u32>,
    /// Indirect call.
    pub icall: Option<bool>,
    /// Indirect-call level.
    pub level_icall: Option<u32>,
    /// Indirect global variable.
    pub indgv: Option<bool>,
    /// Indirect-global-variable level.
    pub level_indgv: Option<u32>,
    /// Control-flow flattening.
    pub cff: Option<bool>,
    /// String encryption (external pass).
    pub cse: Option<bool>,
    /// Constant integer encryption.
    pub cie: Option<bool>,
    /// Constant-integer-encryption level.
    pub level_cie: Option<u32>,
    /// Constant FP encryption.
    pub cfe: Option<bool>,
    /// Constant-FP-encryption level.
    pub level_cfe: Option<u32>,
    /// RTTI scrambler.
    pub rtti: Option<bool>,
    /// Config file path.
    pub config_path: Option<PathBuf>,
}

impl PassFlags {
    /// Whether the pipeline should run at all: the master switch, any
    /// individually enabled pass, or a config path turns it on.
    pub fn pipeline_enabled(&self) -> bool {
        self.irobf
            || self.indbr == Some(true)
            || self.icall == Some(true)
            || self.indgv == Some(true)
            || self.cff == Some(true)
            || self.cse == Some(true)
            || self.cie == Some(true)
            || self.cfe == Some(true)
            || self.rtti == Some(true)
            || self.config_path.is_some()
    }

    /// Load the config file and overlay the explicitly-given flags.
    pub fn resolve_options(&self) -> Result<ObfuscationOptions, ObfuscationError> {
        let mut options = ObfuscationOptions::read_config_file(self.config_path.as_deref())?;
        options.ind_br.read_flags(self.indbr, self.level_indbr);
        options.i_call.read_flags(self.icall, self.level_icall);
        options.ind_gv.read_flags(self.indgv, self.level_indgv);
        options.fla.read_flag(self.cff);
        options.cse.read_flag(self.cse);
        options.cie.read_flags(self.cie, self.level_cie);
        options.cfe.read_flags(self.cfe, self.level_cfe);
        options.rtti.read_flag(self.rtti);
        Ok(options)
    }
}
