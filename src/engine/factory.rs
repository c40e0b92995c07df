use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use strum::EnumString;
use tracing::info;

use super::{Engine, GaussSeidelEngine, SolverOptions};
use crate::config::EngineConfig;
use crate::error::EngineError;

/// Engine selected by the `engine.kind` configuration key
#[derive(Debug, Clone, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum EngineKind {
    /// Built-in reference solver
    GaussSeidel,
    /// Adapter supplied through an [`EngineRegistry`]
    #[strum(default)]
    External(String),
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::GaussSeidel => f.write_str("gauss_seidel"),
            EngineKind::External(name) => f.write_str(name),
        }
    }
}

pub type EngineConstructor =
    Box<dyn Fn(&EngineConfig) -> Result<Box<dyn Engine>, EngineError> + Send + Sync>;

/// Constructors for engines that live outside this crate, keyed by name
#[derive(Default)]
pub struct EngineRegistry {
    constructors: HashMap<String, EngineConstructor>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&EngineConfig) -> Result<Box<dyn Engine>, EngineError> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Box::new(constructor));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Build the engine named by `config.kind`
    pub fn create(&self, config: &EngineConfig) -> Result<Box<dyn Engine>, EngineError> {
        let kind = EngineKind::from_str(config.kind.trim())
            .map_err(|_| EngineError::UnknownEngine(config.kind.clone()))?;

        let engine: Box<dyn Engine> = match &kind {
            EngineKind::GaussSeidel => Box::new(GaussSeidelEngine::new(SolverOptions {
                max_iterations: config.max_iterations,
                tolerance: config.tolerance,
                acceleration: config.acceleration,
            })),
            EngineKind::External(name) => {
                let constructor = self
                    .constructors
                    .get(name)
                    .ok_or_else(|| EngineError::UnknownEngine(name.clone()))?;
                constructor(config)?
            }
        };

        info!(kind = %kind, engine = engine.name(), "engine created");
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;

    fn config(kind: &str) -> EngineConfig {
        EngineConfig {
            kind: kind.to_string(),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!(EngineKind::from_str("gauss_seidel").unwrap(), EngineKind::GaussSeidel);
        assert_eq!(
            EngineKind::from_str("pandapower").unwrap(),
            EngineKind::External("pandapower".to_string())
        );
        assert_eq!(EngineKind::External("opendss".into()).to_string(), "opendss");
    }

    #[test]
    fn test_builtin_engine() {
        let engine = EngineRegistry::new().create(&config("gauss_seidel")).unwrap();
        assert_eq!(engine.name(), "gauss_seidel");
    }

    #[test]
    fn test_unknown_engine() {
        let err = EngineRegistry::new().create(&config("opendss")).err().unwrap();
        assert!(matches!(err, EngineError::UnknownEngine(name) if name == "opendss"));
    }

    #[test]
    fn test_registered_adapter() {
        let mut registry = EngineRegistry::new();
        registry.register("pypsa", |_cfg| {
            let mut mock = MockEngine::new();
            mock.expect_name().return_const("pypsa");
            Ok(Box::new(mock) as Box<dyn Engine>)
        });

        let engine = registry.create(&config("pypsa")).unwrap();
        assert_eq!(engine.name(), "pypsa");
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["pypsa"]);
    }
}
