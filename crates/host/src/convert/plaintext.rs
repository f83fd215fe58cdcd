//! Passthrough converter used when no encryption key is configured.

use common::{error::Result, Key};

use super::{KeyAccess, KeyConversionAction, KeyValueConverter};

#[derive(Debug, Clone)]
pub struct PlaintextKeyValueConverter {
    access: KeyAccess,
}

impl PlaintextKeyValueConverter {
    pub fn new(access: KeyAccess) -> Self {
        Self { access }
    }
}

impl KeyValueConverter for PlaintextKeyValueConverter {
    fn access(&self) -> KeyAccess {
        self.access
    }

    fn read_value(&self, key: &Key) -> Result<String> {
        self.access.validate(KeyConversionAction::Read)?;
        Ok(key.value.clone())
    }

    fn write_value(&self, key: &Key) -> Result<Key> {
        self.access.validate(KeyConversionAction::Write)?;
        Ok(Key::new(key.name.clone(), key.value.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SecretsError;

    #[test]
    fn round_trip_is_identity() {
        let conv = PlaintextKeyValueConverter::new(KeyAccess::ReadWrite);
        let key = Key::new("default", "value");
        let written = conv.write_value(&key).unwrap();
        assert!(!written.is_encrypted);
        assert!(written.encryption_key_id.is_none());
        assert_eq!(conv.read_value(&written).unwrap(), "value");
    }

    #[test]
    fn read_only_refuses_writes() {
        let conv = PlaintextKeyValueConverter::new(KeyAccess::Read);
        assert!(matches!(
            conv.write_value(&Key::new("a", "b")),
            Err(SecretsError::AccessViolation(_))
        ));
    }

    #[test]
    fn write_only_refuses_reads() {
        let conv = PlaintextKeyValueConverter::new(KeyAccess::Write);
        assert!(matches!(
            conv.read_value(&Key::new("a", "b")),
            Err(SecretsError::AccessViolation(_))
        ));
    }
}
