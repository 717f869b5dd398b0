// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! The bus routes every event through a single direct exchange: the routing
//! key is the event name and a queue receives exactly the events it is bound
//! for.

/// Exchange types the bus can declare.
///
/// Only direct routing is used: a queue bound under key `K` receives exactly
/// the messages published with routing key `K`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        }
    }
}

/// Definition of an exchange with its declaration flags.
///
/// The bus exchange is never durable; it is redeclared before every publish
/// and whenever the consumer channel is rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a transient direct exchange definition.
    ///
    /// # Parameters
    /// * `name` - Exchange name shared by publishers and consumers
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_exchange_is_transient_and_direct() {
        let def = ExchangeDefinition::new("orders");

        assert_eq!(def.name(), "orders");
        assert_eq!(def.kind, ExchangeKind::Direct);
        assert!(!def.durable);
    }

    #[test]
    fn kinds_map_onto_lapin() {
        assert_eq!(
            lapin::ExchangeKind::from(ExchangeKind::Direct),
            lapin::ExchangeKind::Direct
        );
    }
}
