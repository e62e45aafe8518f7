//! JSON policy documents
//!
//! ```json
//! {
//!   "effect": "permit",
//!   "subject": {"role": ["admin", "owner"]},
//!   "action": "delete",
//!   "resource": {"classification": "internal"},
//!   "imports": ["data.roles"]
//! }
//! ```
//!
//! A string group value is that group's identifier. Array attribute values
//! are alternatives and expand into one clause per combination.

use pgc_core::{Framework, Program, Value};
use serde_json::Value as Json;

use super::{group_variable, ClauseBuilder, ConversionError, Detection, RuleConverter};

const FRAMEWORK: Framework = Framework::AlternateC;

/// Upper bound on clauses produced by expanding array alternatives
pub const MAX_EXPANSION: usize = 64;

/// Keys carrying metadata only
const METADATA_KEYS: [&str; 5] = ["effect", "id", "name", "description", "version"];

/// Converter for JSON policy documents
#[derive(Debug, Default)]
pub struct JsonPolicyConverter;

impl JsonPolicyConverter {
    pub fn new() -> Self {
        Self
    }

    fn document(
        &self,
        doc: &Json,
        rule_name: &str,
        program: &mut Program,
    ) -> Result<(), ConversionError> {
        let map = doc
            .as_object()
            .ok_or_else(|| ConversionError::malformed(FRAMEWORK, "policy document must be an object"))?;

        let effect = map
            .get("effect")
            .and_then(Json::as_str)
            .ok_or_else(|| ConversionError::malformed(FRAMEWORK, "missing effect"))?;
        if !effect.eq_ignore_ascii_case("permit") {
            return Err(ConversionError::unsupported(
                FRAMEWORK,
                format!("effect '{}'", effect),
            ));
        }

        let mut builders = vec![ClauseBuilder::new(FRAMEWORK)];
        let mut fields: Vec<(&String, &Json)> = map.iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));

        for (key, value) in fields {
            if METADATA_KEYS.contains(&key.as_str()) {
                continue;
            }
            if key == "imports" {
                let imports = value.as_array().ok_or_else(|| {
                    ConversionError::malformed(FRAMEWORK, "imports must be an array of strings")
                })?;
                for import in imports {
                    let import = import.as_str().ok_or_else(|| {
                        ConversionError::malformed(FRAMEWORK, "imports must be an array of strings")
                    })?;
                    program.add_import(import);
                }
                continue;
            }

            let var = group_variable(key).ok_or_else(|| {
                ConversionError::malformed(FRAMEWORK, format!("unknown field '{}'", key))
            })?;
            builders = expand_group(builders, var, key, value)?;
        }

        program
            .clauses
            .extend(builders.into_iter().map(|b| b.build(rule_name)));
        Ok(())
    }
}

fn expand_group(
    builders: Vec<ClauseBuilder>,
    var: &'static str,
    group: &str,
    value: &Json,
) -> Result<Vec<ClauseBuilder>, ConversionError> {
    match value {
        Json::Object(attributes) => {
            let mut builders = builders;
            let mut attributes: Vec<(&String, &Json)> = attributes.iter().collect();
            attributes.sort_by(|a, b| a.0.cmp(b.0));

            for (attribute, raw) in attributes {
                let alternatives = alternatives(group, attribute, raw)?;
                let mut next = Vec::with_capacity(builders.len() * alternatives.len());
                for builder in &builders {
                    for alternative in &alternatives {
                        let mut b = builder.clone();
                        if attribute == "id" {
                            b.bind(var, alternative.clone())?;
                        } else {
                            b.has(var, attribute, alternative.clone())?;
                        }
                        next.push(b);
                    }
                }
                if next.len() > MAX_EXPANSION {
                    return Err(ConversionError::unsupported(
                        FRAMEWORK,
                        format!("more than {} alternative combinations", MAX_EXPANSION),
                    ));
                }
                builders = next;
            }
            Ok(builders)
        }
        scalar => {
            let identifier = Value::from_json(scalar).ok_or_else(|| {
                ConversionError::malformed(FRAMEWORK, format!("'{}' must be an object or identifier", group))
            })?;
            builders
                .into_iter()
                .map(|mut b| b.bind(var, identifier.clone()).map(|_| b))
                .collect()
        }
    }
}

fn alternatives(group: &str, attribute: &str, raw: &Json) -> Result<Vec<Value>, ConversionError> {
    let invalid = || {
        ConversionError::malformed(
            FRAMEWORK,
            format!("'{}.{}' must be a scalar or a non-empty array of scalars", group, attribute),
        )
    };

    match raw {
        Json::Array(items) if items.is_empty() => Err(invalid()),
        Json::Array(items) => items
            .iter()
            .map(|item| Value::from_json(item).ok_or_else(invalid))
            .collect(),
        scalar => Value::from_json(scalar).map(|v| vec![v]).ok_or_else(invalid),
    }
}

fn has_effect(value: &Json) -> bool {
    match value {
        Json::Object(map) => map.contains_key("effect"),
        Json::Array(items) => items.iter().any(has_effect),
        _ => false,
    }
}

impl RuleConverter for JsonPolicyConverter {
    fn framework(&self) -> Framework {
        FRAMEWORK
    }

    fn detect(&self, text: &str) -> Option<Detection> {
        let trimmed = text.trim_start();
        if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
            return None;
        }
        serde_json::from_str::<Json>(text)
            .ok()
            .filter(has_effect)
            .map(|_| Detection::Strong)
    }

    fn convert(&self, text: &str, rule_name: &str) -> Result<Program, ConversionError> {
        let doc: Json = serde_json::from_str(text)
            .map_err(|e| ConversionError::malformed(FRAMEWORK, format!("invalid JSON: {}", e)))?;

        let mut program = Program::new();
        match &doc {
            Json::Array(docs) if docs.is_empty() => {
                return Err(ConversionError::malformed(FRAMEWORK, "empty policy list"))
            }
            Json::Array(docs) => {
                for doc in docs {
                    self.document(doc, rule_name, &mut program)?;
                }
            }
            doc => self.document(doc, rule_name, &mut program)?,
        }

        Ok(program)
    }
}
