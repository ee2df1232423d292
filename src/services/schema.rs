use serde_json::{json, Map, Value};

/// Shape of a structured model answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schema {
    String,
    Integer,
    Array(Box<Schema>),
    Object {
        properties: Vec<(String, Schema)>,
        required: Vec<String>,
    },
}

impl Schema {
    pub fn array_of(items: Schema) -> Self {
        Schema::Array(Box::new(items))
    }

    /// Object whose listed fields are all required.
    pub fn object(fields: &[(&str, Schema)]) -> Self {
        Schema::Object {
            properties: fields
                .iter()
                .map(|(name, schema)| (name.to_string(), schema.clone()))
                .collect(),
            required: fields.iter().map(|(name, _)| name.to_string()).collect(),
        }
    }

    /// Adds a field that may be left out.
    pub fn with_optional(self, name: &str, schema: Schema) -> Self {
        match self {
            Schema::Object {
                mut properties,
                required,
            } => {
                properties.push((name.to_string(), schema));
                Schema::Object {
                    properties,
                    required,
                }
            }
            other => other,
        }
    }

    /// Standard JSON Schema (lowercase type names).
    pub fn to_json_schema(&self) -> Value {
        self.render(|t| t.to_string())
    }

    /// The OpenAPI subset Gemini expects (uppercase type names).
    pub fn to_gemini_schema(&self) -> Value {
        self.render(|t| t.to_uppercase())
    }

    fn render(&self, type_name: fn(&str) -> String) -> Value {
        match self {
            Schema::String => json!({ "type": type_name("string") }),
            Schema::Integer => json!({ "type": type_name("integer") }),
            Schema::Array(items) => json!({
                "type": type_name("array"),
                "items": items.render(type_name),
            }),
            Schema::Object {
                properties,
                required,
            } => {
                let mut props = Map::new();
                for (name, schema) in properties {
                    props.insert(name.clone(), schema.render(type_name));
                }
                json!({
                    "type": type_name("object"),
                    "properties": props,
                    "required": required,
                })
            }
        }
    }

    /// Checks `value` against the schema. Unknown object fields are allowed.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        self.validate_at(value, "$")
    }

    fn validate_at(&self, value: &Value, path: &str) -> Result<(), String> {
        match (self, value) {
            (Schema::String, Value::String(_)) => Ok(()),
            (Schema::Integer, Value::Number(n)) if is_integral(n) => Ok(()),
            (Schema::Array(items), Value::Array(values)) => {
                for (i, v) in values.iter().enumerate() {
                    items.validate_at(v, &format!("{}[{}]", path, i))?;
                }
                Ok(())
            }
            (
                Schema::Object {
                    properties,
                    required,
                },
                Value::Object(map),
            ) => {
                for name in required {
                    if !map.contains_key(name) {
                        return Err(format!("{}: missing required field '{}'", path, name));
                    }
                }
                for (name, schema) in properties {
                    if let Some(v) = map.get(name) {
                        if v.is_null() && !required.contains(name) {
                            continue;
                        }
                        schema.validate_at(v, &format!("{}.{}", path, name))?;
                    }
                }
                Ok(())
            }
            (expected, got) => Err(format!(
                "{}: expected {}, got {}",
                path,
                expected.describe(),
                describe_value(got)
            )),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Schema::String => "string",
            Schema::Integer => "integer",
            Schema::Array(_) => "array",
            Schema::Object { .. } => "object",
        }
    }
}

fn is_integral(n: &serde_json::Number) -> bool {
    n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
}

fn describe_value(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
