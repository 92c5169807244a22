//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (weights > 0, addresses parse)
//! - Reject groups that cannot be balanced (no peers, zero total weight)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: BalancerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::{BalancerConfig, UpstreamConfig};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("upstream with empty name")]
    EmptyGroupName,

    #[error("duplicate upstream \"{0}\"")]
    DuplicateGroup(String),

    #[error("upstream \"{0}\" has no peers")]
    NoPeers(String),

    #[error("upstream \"{group}\": peer {peer} has zero weight")]
    ZeroWeight { group: String, peer: String },

    #[error("upstream \"{group}\": invalid peer address \"{address}\"")]
    InvalidAddress { group: String, address: String },

    #[error("upstream \"{0}\": total weight overflows")]
    WeightOverflow(String),

    #[error("invalid metrics address \"{0}\"")]
    InvalidMetricsAddress(String),
}

/// Validate the whole configuration.
pub fn validate_config(config: &BalancerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = upstreams_errors(&config.upstreams);

    let observability = &config.observability;
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate a set of upstream groups, including name uniqueness.
pub fn validate_upstreams(upstreams: &[UpstreamConfig]) -> Result<(), Vec<ValidationError>> {
    let errors = upstreams_errors(upstreams);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate a single upstream group.
pub fn validate_upstream(upstream: &UpstreamConfig) -> Result<(), Vec<ValidationError>> {
    let errors = upstream_errors(upstream);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn upstreams_errors(upstreams: &[UpstreamConfig]) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for upstream in upstreams {
        if !upstream.name.is_empty() && !seen.insert(upstream.name.as_str()) {
            errors.push(ValidationError::DuplicateGroup(upstream.name.clone()));
        }
        errors.extend(upstream_errors(upstream));
    }

    errors
}

fn upstream_errors(upstream: &UpstreamConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let group = &upstream.name;

    if group.is_empty() {
        errors.push(ValidationError::EmptyGroupName);
    }

    if upstream.peers.is_empty() {
        errors.push(ValidationError::NoPeers(group.clone()));
        return errors;
    }

    let mut total: u32 = 0;
    let mut overflow = false;

    for peer in &upstream.peers {
        if peer.address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidAddress {
                group: group.clone(),
                address: peer.address.clone(),
            });
        }

        if peer.weight == 0 {
            errors.push(ValidationError::ZeroWeight {
                group: group.clone(),
                peer: peer.display_name().to_string(),
            });
        }

        match total.checked_add(peer.weight) {
            Some(sum) => total = sum,
            None => overflow = true,
        }
    }

    if overflow {
        errors.push(ValidationError::WeightOverflow(group.clone()));
    }

    errors
}
