use super::*;
use perm::Perm;
use users::MAX_FIELD;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// leading part of every mount id
    pub id_prefix: String,
    /// permission of new files and directories
    pub default_perm: Perm,
    /// password of `root` in a freshly formatted users table
    pub root_password: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            id_prefix: "50".to_string(),
            default_perm: Perm::DEFAULT,
            root_password: "123".to_string(),
        }
    }
}

impl EngineConfig {
    /// A primary partition id (`prefix + digit + letter`) has to fit the 4-byte id field.
    pub fn validate(&self) -> Result<()> {
        let p = &self.id_prefix;
        if p.is_empty() || p.len() > 2 || !p.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(FsError::InvalidArgument(format!(
                "mount id prefix {:?} must be 1 or 2 alphanumeric characters",
                p
            )));
        }
        let pw = &self.root_password;
        if pw.is_empty() || pw.len() > MAX_FIELD || pw.contains([',', '\n', '\r']) {
            return Err(FsError::InvalidArgument(
                "root password must be 1 to 10 bytes without commas".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = EngineConfig::default();
        assert_eq!(c.id_prefix, "50");
        assert_eq!(c.default_perm.to_string(), "664");
        assert!(c.validate().is_ok());
    }

    #[test]
    fn prefix_must_fit_id_field() {
        let mut c = EngineConfig::default();
        c.id_prefix = "501".to_string();
        assert!(c.validate().is_err());
        c.id_prefix = "4-".to_string();
        assert!(c.validate().is_err());
        c.id_prefix = "7".to_string();
        assert!(c.validate().is_ok());
        c.root_password = "a,b".to_string();
        assert!(c.validate().is_err());
    }
}
