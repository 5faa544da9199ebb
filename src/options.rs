//! Request options, named profiles, and their resolution into the
//! technique set the driver hands to the pass pipeline.
//!
//! Resolution order: profile preset (or the preset bundled by
//! `obfuscationLevel`), then individual keys override. Unknown keys and
//! out-of-range levels surface as `InvalidOption`.

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Basic,
    Standard,
    Professional,
    Enterprise,
    Military,
}

impl Profile {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "basic" => Profile::Basic,
            "standard" => Profile::Standard,
            "professional" => Profile::Professional,
            "enterprise" => Profile::Enterprise,
            "military" => Profile::Military,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Profile::Basic => "basic",
            Profile::Standard => "standard",
            Profile::Professional => "professional",
            Profile::Enterprise => "enterprise",
            Profile::Military => "military",
        }
    }

    /// Advisory strength number attached to the preset.
    pub fn level(self) -> u8 {
        match self {
            Profile::Basic => 2,
            Profile::Standard => 5,
            Profile::Professional => 7,
            Profile::Enterprise => 9,
            Profile::Military => 10,
        }
    }

    /// The preset whose bundle a bare `obfuscationLevel` selects.
    pub fn for_level(level: u8) -> Self {
        match level {
            0..=2 => Profile::Basic,
            3..=5 => Profile::Standard,
            6..=7 => Profile::Professional,
            8..=9 => Profile::Enterprise,
            _ => Profile::Military,
        }
    }

    /// Presets are cumulative: each tier enables everything below it.
    pub fn techniques(self) -> Techniques {
        let mut t = Techniques {
            variable_renaming: true,
            string_encryption: true,
            level: self.level(),
            ..Techniques::default()
        };
        if self >= Profile::Standard {
            t.control_flow = true;
            t.dead_code = true;
            t.anti_debug = true;
        }
        if self >= Profile::Professional {
            t.vm = true;
            t.anti_tampering = true;
            t.integrity_checks = true;
        }
        if self >= Profile::Enterprise {
            t.environment_detection = true;
            t.timing_protection = true;
        }
        if self >= Profile::Military {
            t.memory_protection = true;
            t.stack_randomization = true;
            t.opcode_randomization = true;
        }
        t
    }
}

impl PartialOrd for Profile {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.level().cmp(&other.level()))
    }
}

/// Recognized request keys; everything unset falls back to the resolved
/// preset (or to "off" when no preset is named).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    pub profile: Option<Profile>,
    pub obfuscation_level: Option<u8>,
    pub string_encryption: Option<bool>,
    pub variable_renaming: Option<bool>,
    pub control_flow_obfuscation: Option<bool>,
    pub dead_code_injection: Option<bool>,
    pub vm_obfuscation: Option<bool>,
    pub anti_debug: Option<bool>,
    pub anti_tampering: Option<bool>,
    pub integrity_checks: Option<bool>,
    pub environment_detection: Option<bool>,
    pub timing_protection: Option<bool>,
    pub memory_protection: Option<bool>,
    pub stack_randomization: Option<bool>,
    pub opcode_randomization: Option<bool>,
}

/// Fully resolved technique switches consumed by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Techniques {
    pub variable_renaming: bool,
    pub string_encryption: bool,
    pub control_flow: bool,
    pub dead_code: bool,
    pub vm: bool,
    pub anti_debug: bool,
    pub anti_tampering: bool,
    pub integrity_checks: bool,
    pub environment_detection: bool,
    pub timing_protection: bool,
    pub memory_protection: bool,
    pub stack_randomization: bool,
    pub opcode_randomization: bool,
    pub level: u8,
}

impl Default for Techniques {
    fn default() -> Self {
        Self {
            variable_renaming: false,
            string_encryption: false,
            control_flow: false,
            dead_code: false,
            vm: false,
            anti_debug: false,
            anti_tampering: false,
            integrity_checks: false,
            environment_detection: false,
            timing_protection: false,
            memory_protection: false,
            stack_randomization: false,
            opcode_randomization: false,
            level: 1,
        }
    }
}

impl Techniques {
    pub fn security_level(&self) -> &'static str {
        match self.level {
            0..=3 => "low",
            4..=6 => "standard",
            7..=8 => "high",
            _ => "maximum",
        }
    }
}

impl Options {
    pub fn from_profile(profile: Profile) -> Self {
        Self {
            profile: Some(profile),
            ..Self::default()
        }
    }

    /// Builds options from untyped `key=value` pairs (the CLI and service
    /// surfaces). Unrecognized keys and malformed values are rejected.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut options = Self::default();
        for (key, value) in pairs {
            let key = key.as_ref();
            let value = value.as_ref();
            let invalid = |reason: &str| Error::InvalidOption {
                key: key.to_string(),
                reason: reason.to_string(),
            };
            let flag = |target: &mut Option<bool>| -> Result<(), Error> {
                match value {
                    "true" | "1" => *target = Some(true),
                    "false" | "0" => *target = Some(false),
                    _ => return Err(invalid("expected a boolean")),
                }
                Ok(())
            };
            match key {
                "profile" => {
                    options.profile =
                        Some(Profile::from_name(value).ok_or_else(|| invalid("unknown profile"))?);
                }
                "obfuscationLevel" => {
                    let level: u8 = value.parse().map_err(|_| invalid("expected 1..10"))?;
                    if !(1..=10).contains(&level) {
                        return Err(invalid("expected 1..10"));
                    }
                    options.obfuscation_level = Some(level);
                }
                "stringEncryption" => flag(&mut options.string_encryption)?,
                "variableRenaming" => flag(&mut options.variable_renaming)?,
                "controlFlowObfuscation" => flag(&mut options.control_flow_obfuscation)?,
                "deadCodeInjection" => flag(&mut options.dead_code_injection)?,
                "vmObfuscation" => flag(&mut options.vm_obfuscation)?,
                "antiDebug" => flag(&mut options.anti_debug)?,
                "antiTampering" => flag(&mut options.anti_tampering)?,
                "integrityChecks" => flag(&mut options.integrity_checks)?,
                "environmentDetection" => flag(&mut options.environment_detection)?,
                "timingProtection" => flag(&mut options.timing_protection)?,
                "memoryProtection" => flag(&mut options.memory_protection)?,
                "stackRandomization" => flag(&mut options.stack_randomization)?,
                "opcodeRandomization" => flag(&mut options.opcode_randomization)?,
                _ => return Err(invalid("unrecognized option")),
            }
        }
        Ok(options)
    }

    pub fn resolve(&self) -> Result<Techniques, Error> {
        if let Some(level) = self.obfuscation_level {
            if !(1..=10).contains(&level) {
                return Err(Error::InvalidOption {
                    key: "obfuscationLevel".to_string(),
                    reason: "expected 1..10".to_string(),
                });
            }
        }

        let mut techniques = match (self.profile, self.obfuscation_level) {
            (Some(profile), _) => profile.techniques(),
            (None, Some(level)) => Profile::for_level(level).techniques(),
            (None, None) => Techniques::default(),
        };
        if let Some(level) = self.obfuscation_level {
            techniques.level = level;
        }

        let apply = |target: &mut bool, value: Option<bool>| {
            if let Some(value) = value {
                *target = value;
            }
        };
        apply(&mut techniques.string_encryption, self.string_encryption);
        apply(&mut techniques.variable_renaming, self.variable_renaming);
        apply(&mut techniques.control_flow, self.control_flow_obfuscation);
        apply(&mut techniques.dead_code, self.dead_code_injection);
        apply(&mut techniques.vm, self.vm_obfuscation);
        apply(&mut techniques.anti_debug, self.anti_debug);
        apply(&mut techniques.anti_tampering, self.anti_tampering);
        apply(&mut techniques.integrity_checks, self.integrity_checks);
        apply(
            &mut techniques.environment_detection,
            self.environment_detection,
        );
        apply(&mut techniques.timing_protection, self.timing_protection);
        apply(&mut techniques.memory_protection, self.memory_protection);
        apply(
            &mut techniques.stack_randomization,
            self.stack_randomization,
        );
        apply(
            &mut techniques.opcode_randomization,
            self.opcode_randomization,
        );
        Ok(techniques)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_profile_enables_rename_and_strings_only() {
        let techniques = Options::from_profile(Profile::Basic)
            .resolve()
            .expect("resolve");
        assert!(techniques.variable_renaming);
        assert!(techniques.string_encryption);
        assert!(!techniques.control_flow);
        assert!(!techniques.vm);
        assert_eq!(techniques.level, 2);
    }

    #[test]
    fn presets_are_cumulative() {
        let standard = Profile::Standard.techniques();
        assert!(standard.control_flow && standard.dead_code && standard.anti_debug);
        assert!(!standard.vm);

        let professional = Profile::Professional.techniques();
        assert!(professional.control_flow && professional.vm && professional.anti_tampering);
        assert!(professional.integrity_checks);
        assert!(!professional.environment_detection);

        let military = Profile::Military.techniques();
        assert!(military.memory_protection);
        assert!(military.stack_randomization && military.opcode_randomization);
        assert_eq!(military.level, 10);
    }

    #[test]
    fn individual_keys_override_the_preset() {
        let options = Options {
            profile: Some(Profile::Standard),
            dead_code_injection: Some(false),
            vm_obfuscation: Some(true),
            ..Options::default()
        };
        let techniques = options.resolve().expect("resolve");
        assert!(!techniques.dead_code);
        assert!(techniques.vm);
        assert!(techniques.control_flow);
    }

    #[test]
    fn bare_level_bundles_a_preset() {
        let options = Options {
            obfuscation_level: Some(4),
            ..Options::default()
        };
        let techniques = options.resolve().expect("resolve");
        assert!(techniques.control_flow);
        assert!(!techniques.vm);
        assert_eq!(techniques.level, 4);
    }

    #[test]
    fn level_out_of_range_is_invalid() {
        let options = Options {
            obfuscation_level: Some(11),
            ..Options::default()
        };
        let error = options.resolve().expect_err("must fail");
        assert!(matches!(error, Error::InvalidOption { key, .. } if key == "obfuscationLevel"));
    }

    #[test]
    fn empty_options_disable_everything() {
        let techniques = Options::default().resolve().expect("resolve");
        assert_eq!(techniques, Techniques::default());
    }

    #[test]
    fn pairs_parse_and_validate() {
        let options = Options::from_pairs([
            ("profile", "professional"),
            ("stringEncryption", "false"),
            ("obfuscationLevel", "7"),
        ])
        .expect("valid pairs");
        assert_eq!(options.profile, Some(Profile::Professional));
        assert_eq!(options.string_encryption, Some(false));

        let error = Options::from_pairs([("colorScheme", "true")]).expect_err("unknown key");
        assert!(matches!(error, Error::InvalidOption { key, .. } if key == "colorScheme"));

        let error = Options::from_pairs([("antiDebug", "maybe")]).expect_err("bad value");
        assert!(matches!(error, Error::InvalidOption { key, .. } if key == "antiDebug"));

        let error = Options::from_pairs([("profile", "ultra")]).expect_err("bad profile");
        assert!(matches!(error, Error::InvalidOption { key, .. } if key == "profile"));
    }

    #[test]
    fn options_deserialize_from_request_key_names() {
        let parsed: Options = serde_json::from_str(
            r#"{ "profile": "standard", "vmObfuscation": true, "obfuscationLevel": 6 }"#,
        )
        .expect("deserialize");
        assert_eq!(parsed.profile, Some(Profile::Standard));
        assert_eq!(parsed.vm_obfuscation, Some(true));
        assert_eq!(parsed.obfuscation_level, Some(6));
    }

    #[test]
    fn security_level_labels() {
        let label = |level: u8| Techniques {
            level,
            ..Techniques::default()
        };
        assert_eq!(label(2).security_level(), "low");
        assert_eq!(label(5).security_level(), "standard");
        assert_eq!(label(7).security_level(), "high");
        assert_eq!(label(10).security_level(), "maximum");
    }
}
