//! Listening requests describing which providers a collector enables

use crate::error::ProviderError;
use crate::events::TraceLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One provider to enable on a trace session
///
/// A request selects its provider either by GUID or by name. When a
/// non-nil GUID is present it takes precedence over the name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListeningRequest {
    #[serde(default)]
    provider_name: Option<String>,
    #[serde(default)]
    provider_guid: Option<Uuid>,
    #[serde(default)]
    level: TraceLevel,
    #[serde(default)]
    keywords: u64,
}

/// Effective provider selector of a listening request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderSelector<'a> {
    Guid(Uuid),
    Name(&'a str),
}

impl ListeningRequest {
    /// Create a request that selects a provider by name
    ///
    /// # Example
    ///
    /// ```
    /// use etw_collector::events::TraceLevel;
    /// use etw_collector::request::ListeningRequest;
    ///
    /// let request = ListeningRequest::by_name("Microsoft-Windows-DNS-Client", TraceLevel::Informational, 0);
    /// assert!(request.validate().is_ok());
    /// ```
    pub fn by_name(name: impl Into<String>, level: TraceLevel, keywords: u64) -> Self {
        Self {
            provider_name: Some(name.into()),
            provider_guid: None,
            level,
            keywords,
        }
    }

    /// Create a request that selects a provider by GUID
    pub fn by_guid(guid: Uuid, level: TraceLevel, keywords: u64) -> Self {
        Self {
            provider_name: None,
            provider_guid: Some(guid),
            level,
            keywords,
        }
    }

    /// Create a request carrying both selectors; the GUID wins when non-nil
    pub fn new(
        provider_name: Option<String>,
        provider_guid: Option<Uuid>,
        level: TraceLevel,
        keywords: u64,
    ) -> Self {
        Self {
            provider_name,
            provider_guid,
            level,
            keywords,
        }
    }

    pub fn provider_name(&self) -> Option<&str> {
        self.provider_name.as_deref()
    }

    pub fn provider_guid(&self) -> Option<Uuid> {
        self.provider_guid
    }

    pub fn level(&self) -> TraceLevel {
        self.level
    }

    pub fn keywords(&self) -> u64 {
        self.keywords
    }

    /// GUID to register with, if a non-nil one was supplied
    fn usable_guid(&self) -> Option<Uuid> {
        self.provider_guid.filter(|guid| !guid.is_nil())
    }

    /// Name to register with, if a non-blank one was supplied
    fn usable_name(&self) -> Option<&str> {
        self.provider_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
    }

    /// Selector used for registration, `None` when the request is unusable
    pub fn selector(&self) -> Option<ProviderSelector<'_>> {
        match self.usable_guid() {
            Some(guid) => Some(ProviderSelector::Guid(guid)),
            None => self.usable_name().map(ProviderSelector::Name),
        }
    }

    /// Human-readable selector for diagnostics: the name if present, else the GUID
    pub fn display_selector(&self) -> String {
        match (&self.provider_name, self.provider_guid) {
            (Some(name), _) if !name.is_empty() => name.clone(),
            (_, Some(guid)) => guid.to_string(),
            _ => "<unnamed provider>".to_string(),
        }
    }

    /// Check that the request names a usable provider
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Validation` when neither a non-blank name nor a
    /// non-nil GUID is present.
    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.selector().is_none() {
            return Err(ProviderError::Validation(
                "either provider_name or a non-empty provider_guid must be specified".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ListeningRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (level: {:?}, keywords: {:#x})",
            self.display_selector(),
            self.level,
            self.keywords
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_by_name_selector() {
        let request = ListeningRequest::by_name("A", TraceLevel::Informational, 0);
        assert_eq!(request.selector(), Some(ProviderSelector::Name("A")));
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_guid_takes_precedence() {
        let guid = Uuid::from_u128(0x22fb2cd6_0e7b_422b_a0c7_2fad1fd0e716);
        let request = ListeningRequest::new(
            Some("Microsoft-Windows-Kernel-Process".to_string()),
            Some(guid),
            TraceLevel::Verbose,
            0x10,
        );

        assert_eq!(request.selector(), Some(ProviderSelector::Guid(guid)));
        // Diagnostics still prefer the readable name
        assert_eq!(request.display_selector(), "Microsoft-Windows-Kernel-Process");
    }

    #[test]
    fn test_nil_guid_falls_back_to_name() {
        let request = ListeningRequest::new(
            Some("B".to_string()),
            Some(Uuid::nil()),
            TraceLevel::Warning,
            0,
        );
        assert_eq!(request.selector(), Some(ProviderSelector::Name("B")));
    }

    #[test]
    fn test_empty_request_fails_validation() {
        let request = ListeningRequest::new(None, Some(Uuid::nil()), TraceLevel::Verbose, 0);
        assert!(matches!(
            request.validate(),
            Err(ProviderError::Validation(_))
        ));

        let blank = ListeningRequest::by_name("   ", TraceLevel::Verbose, 0);
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_display_selector_uses_guid_without_name() {
        let guid = Uuid::from_u128(0xF);
        let request = ListeningRequest::by_guid(guid, TraceLevel::Verbose, 0xF);
        assert_eq!(request.display_selector(), guid.to_string());
        assert!(request.to_string().contains("keywords: 0xf"));
    }

    #[test]
    fn test_deserialize_from_toml() {
        let request: ListeningRequest = toml::from_str(
            r#"
            provider_guid = "22fb2cd6-0e7b-422b-a0c7-2fad1fd0e716"
            level = "verbose"
            keywords = 16
            "#,
        )
        .unwrap();

        assert_eq!(request.level(), TraceLevel::Verbose);
        assert_eq!(request.keywords(), 16);
        assert!(request.provider_name().is_none());
    }
}
