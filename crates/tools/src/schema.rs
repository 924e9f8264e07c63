//! Typed tool input schemas.
//!
//! Each tool declares named fields with a type and description. The same
//! declaration renders to JSON Schema for the LLM and validates incoming
//! arguments before dispatch.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Array(Box<FieldType>),
    Object,
}

impl FieldType {
    fn json_name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array(_) => "array",
            FieldType::Object => "object",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array(inner) => value
                .as_array()
                .map(|items| items.iter().all(|v| inner.matches(v)))
                .unwrap_or(false),
            FieldType::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub ty: FieldType,
    pub description: String,
    pub required: bool,
}

/// A tool's declared parameters.
#[derive(Debug, Clone, Default)]
pub struct InputSchema {
    pub fields: Vec<FieldSpec>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &str, ty: FieldType, description: &str) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            ty,
            description: description.into(),
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: &str, ty: FieldType, description: &str) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            ty,
            description: description.into(),
            required: false,
        });
        self
    }

    /// Render as the JSON Schema object the LLM sees.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();

        for field in &self.fields {
            let mut prop = serde_json::Map::new();
            prop.insert("type".into(), Value::String(field.ty.json_name().into()));
            prop.insert(
                "description".into(),
                Value::String(field.description.clone()),
            );
            if let FieldType::Array(inner) = &field.ty {
                prop.insert(
                    "items".into(),
                    serde_json::json!({ "type": inner.json_name() }),
                );
            }
            properties.insert(field.name.clone(), Value::Object(prop));
            if field.required {
                required.push(Value::String(field.name.clone()));
            }
        }

        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Validate arguments. Returns a human-readable description of every
    /// problem found, or `Ok(())`.
    pub fn validate(&self, args: &Value) -> Result<(), String> {
        let Some(object) = args.as_object() else {
            return Err("arguments must be a JSON object".into());
        };

        let mut problems = Vec::new();

        for field in &self.fields {
            match object.get(&field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        problems.push(format!("missing required field '{}'", field.name));
                    }
                }
                Some(value) => {
                    if !field.ty.matches(value) {
                        problems.push(format!(
                            "field '{}' must be of type {}",
                            field.name,
                            field.ty.json_name()
                        ));
                    }
                }
            }
        }

        for key in object.keys() {
            if !self.fields.iter().any(|f| &f.name == key) {
                problems.push(format!("unknown field '{key}'"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }
}
