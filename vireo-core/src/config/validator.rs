//! # Configuration Validation
//!
//! Eager consistency checks run before any store or transport is created.

use tracing::{debug, warn};

use crate::config::schema::{BrokerConfig, DestinationDescriptor, NetworkConfig, TransportSettings};
use crate::protocol::PACKET_HEADER_SIZE;
use crate::{Error, Result};

/// Smallest usable block size.
pub const MIN_BLOCK_SIZE: u32 = 16;

/// Largest supported block size (1 MiB).
pub const MAX_BLOCK_SIZE: u32 = 1024 * 1024;

/// Stateless configuration validator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the whole broker configuration.
    ///
    /// # Errors
    /// Returns the first violated rule.
    pub fn validate(config: &BrokerConfig) -> Result<()> {
        debug!("Starting configuration validation");
        Self::validate_network(&config.network)?;
        Self::validate_transport(&config.transport)?;

        let mut names = std::collections::HashSet::new();
        for descriptor in &config.destinations {
            Self::validate_descriptor(descriptor)?;
            if !names.insert(descriptor.name.as_str()) {
                return Err(Error::invalid_descriptor(&descriptor.name, "duplicate destination name"));
            }
        }
        debug!(destinations = config.destinations.len(), "Configuration validation completed");
        Ok(())
    }

    /// Validate one destination descriptor.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDescriptor`] naming the violated rule.
    pub fn validate_descriptor(d: &DestinationDescriptor) -> Result<()> {
        let fail = |message: String| Err(Error::invalid_descriptor(&d.name, message));

        if d.name.is_empty() {
            return fail("name must not be empty".into());
        }
        if !d.name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')) {
            return fail("name may only contain ASCII letters, digits, '.', '-' and '_'".into());
        }
        if d.data_folder.as_os_str().is_empty() {
            return fail("data_folder must be set".into());
        }
        if d.data_folder.is_file() {
            return fail(format!("data_folder {} is a file", d.data_folder.display()));
        }
        if let Some(journal) = &d.journal_folder {
            if journal.is_file() {
                return fail(format!("journal_folder {} is a file", journal.display()));
            }
        }
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&d.block_size) {
            return fail(format!(
                "block_size {} outside [{MIN_BLOCK_SIZE}, {MAX_BLOCK_SIZE}]",
                d.block_size
            ));
        }
        if d.initial_block_count == 0 {
            return fail("initial_block_count must be at least 1".into());
        }
        if d.max_block_count > i32::MAX as u32 {
            return fail("max_block_count exceeds the handle range".into());
        }
        if d.initial_block_count > d.max_block_count {
            return fail(format!(
                "initial_block_count {} exceeds max_block_count {}",
                d.initial_block_count, d.max_block_count
            ));
        }
        if d.auto_extend_amount > d.max_block_count {
            return fail(format!(
                "auto_extend_amount {} exceeds max_block_count {}",
                d.auto_extend_amount, d.max_block_count
            ));
        }
        if u64::from(d.block_size) * u64::from(d.max_block_count) > i64::MAX as u64 {
            return fail("maximum store size overflows file offsets".into());
        }
        if d.use_journal {
            if d.max_journal_size == 0 {
                return fail("max_journal_size must be positive".into());
            }
            if d.max_write_batch_size == 0 {
                return fail("max_write_batch_size must be at least 1".into());
            }
            if d.max_unflushed_journal_size == 0 || d.max_uncommitted_store_size == 0 {
                return fail("journal thresholds must be positive".into());
            }
            if d.max_write_batch_size > d.max_unflushed_journal_size {
                warn!(
                    destination = %d.name,
                    "max_write_batch_size above max_unflushed_journal_size, producers will throttle before batches fill"
                );
            }
        }
        Ok(())
    }

    /// Validate transport tuning.
    ///
    /// # Errors
    /// Returns a configuration error naming the violated rule.
    pub fn validate_transport(t: &TransportSettings) -> Result<()> {
        if t.send_queue_max_size == 0 {
            return Err(Error::configuration("send_queue_max_size must be at least 1"));
        }
        if t.max_untrusted_packet_size < PACKET_HEADER_SIZE {
            return Err(Error::configuration("max_untrusted_packet_size too small for a packet"));
        }
        if t.max_untrusted_packet_size > t.max_packet_size {
            return Err(Error::configuration(
                "max_untrusted_packet_size must not exceed max_packet_size",
            ));
        }
        if i32::try_from(t.max_packet_size).is_err() {
            return Err(Error::configuration("max_packet_size exceeds the frame length range"));
        }
        if t.stream_send_buffer_size == 0 || t.stream_recv_buffer_size == 0 {
            return Err(Error::configuration("stream buffer sizes must be positive"));
        }
        if t.connect_timeout_ms == 0 {
            return Err(Error::configuration("connect_timeout_ms must be positive"));
        }
        if t.watchdog_period_ms == 0 || t.multiplexer_timeout_ms == 0 {
            return Err(Error::configuration("watchdog and multiplexer periods must be positive"));
        }
        Ok(())
    }

    /// Validate listener settings.
    ///
    /// # Errors
    /// Returns a configuration error naming the violated rule.
    pub fn validate_network(n: &NetworkConfig) -> Result<()> {
        if n.max_connections == 0 {
            return Err(Error::configuration("max_connections must be greater than 0"));
        }
        if n.bind_address.port() != 0 && n.bind_address.port() < 1024 {
            warn!("Using privileged port {} may require special permissions", n.bind_address.port());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn descriptor() -> DestinationDescriptor {
        DestinationDescriptor::new("orders", "/tmp/vireo-validator")
    }

    #[test]
    fn test_default_descriptor_is_valid() {
        assert!(descriptor().validate().is_ok());
    }

    #[test]
    fn test_invalid_descriptors() {
        let cases: Vec<Box<dyn Fn(&mut DestinationDescriptor)>> = vec![
            Box::new(|d| d.name.clear()),
            Box::new(|d| d.name = "bad/name".into()),
            Box::new(|d| d.block_size = 8),
            Box::new(|d| d.block_size = MAX_BLOCK_SIZE + 1),
            Box::new(|d| d.initial_block_count = 0),
            Box::new(|d| {
                d.initial_block_count = 10;
                d.max_block_count = 5;
            }),
            Box::new(|d| d.auto_extend_amount = d.max_block_count + 1),
            Box::new(|d| d.max_journal_size = 0),
            Box::new(|d| d.max_write_batch_size = 0),
        ];
        for mutate in cases {
            let mut d = descriptor();
            mutate(&mut d);
            let err = d.validate().unwrap_err();
            assert_eq!(err.code(), crate::ErrorCode::InvalidDescriptor, "{d:?}");
        }
    }

    #[test]
    fn test_journal_thresholds_ignored_without_journal() {
        let mut d = descriptor();
        d.use_journal = false;
        d.max_journal_size = 0;
        assert!(d.validate().is_ok());
    }

    #[test]
    fn test_data_folder_must_not_be_a_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        let d = DestinationDescriptor::new("q", &file);
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_duplicate_destinations() {
        let mut config = BrokerConfig::default();
        config.destinations.push(descriptor());
        config.destinations.push(descriptor());
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_transport_rules() {
        let mut t = TransportSettings::default();
        assert!(ConfigValidator::validate_transport(&t).is_ok());
        t.max_untrusted_packet_size = t.max_packet_size + 1;
        assert!(ConfigValidator::validate_transport(&t).is_err());
    }
}
