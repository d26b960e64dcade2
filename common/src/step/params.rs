use serde_json::{Map, Value};

use crate::error::StepValidationError;

/// Lee el mapa de configuración de un paso hacia campos tipados,
/// acumulando todos los problemas en vez de cortar en el primero.
pub struct ConfigReader<'a> {
    map: &'a Map<String, Value>,
    errors: Vec<String>,
}

impl<'a> ConfigReader<'a> {
    pub fn new(map: &'a Map<String, Value>) -> Self {
        Self {
            map,
            errors: Vec::new(),
        }
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has(&self, key: &str) -> bool {
        self.map.get(key).map(|v| !v.is_null()).unwrap_or(false)
    }

    pub fn required_str(&mut self, key: &str) -> String {
        match self.optional_str(key) {
            Some(s) if !s.trim().is_empty() => s,
            Some(_) => {
                self.error(format!("'{}' no puede estar vacío", key));
                String::new()
            }
            None => {
                if !self.has(key) {
                    self.error(format!("falta la clave requerida '{}'", key));
                }
                String::new()
            }
        }
    }

    pub fn optional_str(&mut self, key: &str) -> Option<String> {
        match self.map.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => {
                self.error(format!("'{}' debe ser texto", key));
                None
            }
        }
    }

    pub fn optional_u64(&mut self, key: &str) -> Option<u64> {
        match self.map.get(key) {
            None | Some(Value::Null) => None,
            Some(v) => match v.as_u64() {
                Some(n) => Some(n),
                None => {
                    self.error(format!("'{}' debe ser un entero no negativo", key));
                    None
                }
            },
        }
    }

    pub fn optional_map(&mut self, key: &str) -> Map<String, Value> {
        match self.map.get(key) {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(m)) => m.clone(),
            Some(_) => {
                self.error(format!("'{}' debe ser un diccionario", key));
                Map::new()
            }
        }
    }

    /// Mapa de texto a texto; los escalares se convierten a texto.
    pub fn optional_string_map(&mut self, key: &str) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (k, v) in self.optional_map(key) {
            match v {
                Value::String(s) => out.push((k, s)),
                Value::Number(n) => out.push((k, n.to_string())),
                Value::Bool(b) => out.push((k, b.to_string())),
                _ => self.error(format!("'{}.{}' debe ser un escalar", key, k)),
            }
        }
        out
    }

    pub fn optional_int_list(&mut self, key: &str) -> Option<Vec<i64>> {
        match self.map.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) => {
                let parsed: Option<Vec<i64>> = items.iter().map(Value::as_i64).collect();
                if parsed.is_none() {
                    self.error(format!("'{}' debe ser una lista de enteros", key));
                }
                parsed
            }
            Some(_) => {
                self.error(format!("'{}' debe ser una lista", key));
                None
            }
        }
    }

    pub fn finish<T>(self, step_id: &str, value: T) -> Result<T, StepValidationError> {
        if self.errors.is_empty() {
            Ok(value)
        } else {
            Err(StepValidationError::new(step_id, self.errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn acumula_todos_los_errores() {
        let map = json!({"query": "", "max_rows": -1, "headers": "x"})
            .as_object()
            .cloned()
            .unwrap();
        let mut reader = ConfigReader::new(&map);

        reader.required_str("query");
        reader.required_str("connection");
        reader.optional_u64("max_rows");
        reader.optional_map("headers");

        let err = reader.finish("s", ()).unwrap_err();
        assert_eq!(err.errors.len(), 4);
    }

    #[test]
    fn mapa_de_texto_convierte_escalares() {
        let map = json!({"env": {"A": "1", "B": 2, "C": true}})
            .as_object()
            .cloned()
            .unwrap();
        let mut reader = ConfigReader::new(&map);

        let mut env = reader.optional_string_map("env");
        env.sort();
        assert_eq!(
            env,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "2".to_string()),
                ("C".to_string(), "true".to_string()),
            ]
        );
        assert!(reader.finish("s", ()).is_ok());
    }
}
