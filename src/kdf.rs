use crate::error::ConvertError;

/// PBKDF algorithms and hashes accepted for FIPS 140-3 key derivation.
const FIPS_PBKDF: &str = "pbkdf2";
const FIPS_HASHES: &[&str] = &["sha256", "sha384", "sha512"];

/// Key-derivation parameters a keyslot is converted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfTarget {
    pbkdf: String,
    hash: String,
    iterations: u32,
}

impl Default for KdfTarget {
    fn default() -> Self {
        Self {
            pbkdf: FIPS_PBKDF.to_string(),
            hash: "sha512".to_string(),
            iterations: 1_000_000,
        }
    }
}

impl KdfTarget {
    pub fn new(
        pbkdf: impl Into<String>,
        hash: impl Into<String>,
        iterations: u32,
    ) -> Result<Self, ConvertError> {
        let target = Self {
            pbkdf: pbkdf.into().trim().to_ascii_lowercase(),
            hash: hash.into().trim().to_ascii_lowercase(),
            iterations,
        };
        target.validate()?;
        Ok(target)
    }

    pub fn pbkdf(&self) -> &str {
        &self.pbkdf
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn validate(&self) -> Result<(), ConvertError> {
        if self.pbkdf.is_empty() {
            return Err(ConvertError::InvalidTarget("pbkdf cannot be empty".into()));
        }
        if self.hash.is_empty() {
            return Err(ConvertError::InvalidTarget("hash cannot be empty".into()));
        }
        if self.iterations == 0 {
            return Err(ConvertError::InvalidTarget(
                "iteration count must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Whether this combination is an approved FIPS key derivation.
    pub fn is_fips_approved(&self) -> bool {
        self.pbkdf == FIPS_PBKDF && FIPS_HASHES.contains(&self.hash.as_str())
    }
}
