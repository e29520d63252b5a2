//! Parsing of `--volume` and `--config` arguments.

use std::str::FromStr;

use crate::docker::models::{Mount, MountType};
use crate::error::ConfigError;

/// Default file mode for attached configs (0444).
pub const DEFAULT_CONFIG_MODE: u32 = 0o444;

/// A bind mount, `source:target[:ro|rw]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl FromStr for VolumeSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidVolume(s.to_string());
        let parts: Vec<&str> = s.split(':').collect();
        let (source, target, read_only) = match parts.as_slice() {
            [source, target] => (*source, *target, false),
            [source, target, "ro"] => (*source, *target, true),
            [source, target, "rw"] => (*source, *target, false),
            _ => return Err(invalid()),
        };
        if source.is_empty() || target.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            source: source.to_string(),
            target: target.to_string(),
            read_only,
        })
    }
}

impl VolumeSpec {
    pub fn to_mount(&self) -> Mount {
        Mount {
            source: self.source.clone(),
            target: self.target.clone(),
            mount_type: MountType::Bind,
            read_only: self.read_only,
            extra: Default::default(),
        }
    }
}

/// A swarm config exposed as a file in the container.
///
/// Written as comma separated `key=value` pairs, e.g.
/// `source=app.toml,target=/etc/app.toml,mode=0400`. A bare token is
/// shorthand for `source=<token>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSpec {
    pub source: String,
    pub target: String,
    pub uid: String,
    pub gid: String,
    pub mode: u32,
}

impl FromStr for ConfigSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut source = None;
        let mut target = None;
        let mut uid = None;
        let mut gid = None;
        let mut mode = None;

        for field in s.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            let Some((key, value)) = field.split_once('=') else {
                source = Some(field.to_string());
                continue;
            };
            match key.trim() {
                "source" | "src" => source = Some(value.to_string()),
                "target" => target = Some(value.to_string()),
                "uid" => uid = Some(value.to_string()),
                "gid" => gid = Some(value.to_string()),
                "mode" => {
                    let parsed = u32::from_str_radix(value, 8)
                        .map_err(|_| ConfigError::InvalidMode(value.to_string()))?;
                    mode = Some(parsed);
                }
                other => {
                    return Err(ConfigError::UnknownConfigField {
                        field: other.to_string(),
                        spec: s.to_string(),
                    });
                }
            }
        }

        let source = source
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::ConfigSourceMissing(s.to_string()))?;
        Ok(Self {
            target: target.unwrap_or_else(|| format!("/{source}")),
            uid: uid.unwrap_or_else(|| "0".into()),
            gid: gid.unwrap_or_else(|| "0".into()),
            mode: mode.unwrap_or(DEFAULT_CONFIG_MODE),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume() {
        let v: VolumeSpec = "/data:/mnt".parse().unwrap();
        assert_eq!(v.source, "/data");
        assert_eq!(v.target, "/mnt");
        assert!(!v.read_only);

        let mount = "/etc/certs:/certs:ro".parse::<VolumeSpec>().unwrap().to_mount();
        assert_eq!(mount.mount_type, MountType::Bind);
        assert!(mount.read_only);
    }

    #[test]
    fn test_volume_rejects_named_and_malformed() {
        for bad in ["cache", "/a:", ":/b", "/a:/b:xx", "/a:/b:ro:rw"] {
            assert!(
                matches!(bad.parse::<VolumeSpec>(), Err(ConfigError::InvalidVolume(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_config_defaults() {
        let c: ConfigSpec = "myconf".parse().unwrap();
        assert_eq!(c.source, "myconf");
        assert_eq!(c.target, "/myconf");
        assert_eq!(c.uid, "0");
        assert_eq!(c.gid, "0");
        assert_eq!(c.mode, 292);
    }

    #[test]
    fn test_config_fields() {
        let c: ConfigSpec = "source=app,target=/etc/app.toml,uid=1000,gid=100,mode=0600"
            .parse()
            .unwrap();
        assert_eq!(c.source, "app");
        assert_eq!(c.target, "/etc/app.toml");
        assert_eq!(c.uid, "1000");
        assert_eq!(c.gid, "100");
        assert_eq!(c.mode, 384);

        let c: ConfigSpec = "source=app,mode=600".parse().unwrap();
        assert_eq!(c.mode, 384);
    }

    #[test]
    fn test_config_errors() {
        assert!(matches!(
            "target=/x".parse::<ConfigSpec>(),
            Err(ConfigError::ConfigSourceMissing(_))
        ));
        assert!(matches!(
            "source=a,mode=0999".parse::<ConfigSpec>(),
            Err(ConfigError::InvalidMode(_))
        ));
        assert!(matches!(
            "source=a,owner=me".parse::<ConfigSpec>(),
            Err(ConfigError::UnknownConfigField { ref field, .. }) if field == "owner"
        ));
    }
}
