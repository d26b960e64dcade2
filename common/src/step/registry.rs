use std::collections::HashMap;

use tracing::debug;

use super::Step;
use crate::error::StepValidationError;
use crate::job::StepConfiguration;

/// Constructor de un tipo de paso: valida la config y devuelve la instancia.
pub type StepFactory =
    Box<dyn Fn(&StepConfiguration) -> Result<Box<dyn Step>, StepValidationError> + Send + Sync>;

/// Mapa explícito tipo → constructor. Se llena al arrancar el proceso.
#[derive(Default)]
pub struct StepRegistry {
    factories: HashMap<String, StepFactory>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&StepConfiguration) -> Result<Box<dyn Step>, StepValidationError>
            + Send
            + Sync
            + 'static,
    {
        debug!("registrando tipo de paso '{}'", kind);
        self.factories.insert(kind.to_string(), Box::new(factory));
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Tipos registrados, ordenados.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Construye el paso aplicando las reglas genéricas y las del tipo.
    pub fn create(&self, cfg: &StepConfiguration) -> Result<Box<dyn Step>, StepValidationError> {
        let mut errors = cfg.validate();

        match self.factories.get(&cfg.step_type) {
            None => errors.push(format!(
                "tipo de paso desconocido '{}'. Disponibles: {}",
                cfg.step_type,
                self.kinds().join(", ")
            )),
            Some(factory) => match factory(cfg) {
                Ok(step) if errors.is_empty() => return Ok(step),
                Ok(_) => {}
                Err(e) => errors.extend(e.errors),
            },
        }

        Err(StepValidationError::new(cfg.step_id.clone(), errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::testing::ScriptedStep;
    use serde_json::{json, Map};

    fn registry_with_fake() -> StepRegistry {
        let mut registry = StepRegistry::new();
        registry.register("fake", |cfg| {
            if cfg.config.contains_key("query") {
                let mut step = ScriptedStep::new(&cfg.step_id, 0);
                step.cfg = cfg.clone();
                Ok(Box::new(step) as Box<dyn Step>)
            } else {
                Err(StepValidationError::new(
                    cfg.step_id.clone(),
                    vec!["falta 'query'".into()],
                ))
            }
        });
        registry
    }

    #[test]
    fn crea_pasos_registrados() {
        let registry = registry_with_fake();
        let cfg = StepConfiguration::new(
            "s1",
            "fake",
            json!({"query": "x"}).as_object().cloned().unwrap(),
        );

        let step = registry.create(&cfg).unwrap();
        assert_eq!(step.config().step_id, "s1");
        assert_eq!(registry.kinds(), vec!["fake".to_string()]);
    }

    #[test]
    fn tipo_desconocido_es_error_de_validacion() {
        let registry = registry_with_fake();
        let cfg = StepConfiguration::new(
            "s1",
            "ftp",
            json!({"x": 1}).as_object().cloned().unwrap(),
        );

        let err = registry.create(&cfg).err().unwrap();
        assert_eq!(err.step_id, "s1");
        assert!(err.errors[0].contains("desconocido 'ftp'"));
    }

    #[test]
    fn junta_errores_genericos_y_del_tipo() {
        let registry = registry_with_fake();
        let mut cfg = StepConfiguration::new("s1", "fake", Map::new());
        cfg.timeout = Some(0);

        let err = registry.create(&cfg).err().unwrap();
        // config vacío + timeout 0 + falta query
        assert_eq!(err.errors.len(), 3);
    }
}
