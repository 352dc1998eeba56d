//! The schema index: per-model attribute and link metadata.
//!
//! Pure lookup. Every component that needs to know a link's cardinality,
//! target model, or inverse consults this index; lookups against undeclared
//! names are configuration defects and fail synchronously.
use crate::errors::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Relationship cardinality. Dispatch throughout the engine is an explicit
/// match on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    HasOne,
    HasMany,
}

/// Static definition of one link on one model. Links are always declared in
/// inverse pairs: `inverse` names the link on `model` that mirrors this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkDefinition {
    pub cardinality: Cardinality,
    pub model: String,
    pub inverse: String,
}

/// Attributes and links declared for one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub attributes: Vec<String>,
    pub links: BTreeMap<String, LinkDefinition>,
}

impl ModelDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attribute(mut self, name: impl Into<String>) -> Self {
        self.attributes.push(name.into());
        self
    }

    pub fn has_one(
        mut self,
        link: impl Into<String>,
        model: impl Into<String>,
        inverse: impl Into<String>,
    ) -> Self {
        self.links.insert(
            link.into(),
            LinkDefinition {
                cardinality: Cardinality::HasOne,
                model: model.into(),
                inverse: inverse.into(),
            },
        );
        self
    }

    pub fn has_many(
        mut self,
        link: impl Into<String>,
        model: impl Into<String>,
        inverse: impl Into<String>,
    ) -> Self {
        self.links.insert(
            link.into(),
            LinkDefinition {
                cardinality: Cardinality::HasMany,
                model: model.into(),
                inverse: inverse.into(),
            },
        );
        self
    }
}

/// Model-name → definition lookup shared by the expander, sequencer, and
/// subscription manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    models: BTreeMap<String, ModelDefinition>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, name: impl Into<String>, definition: ModelDefinition) -> Self {
        self.models.insert(name.into(), definition);
        self
    }

    pub fn model(&self, name: &str) -> Result<&ModelDefinition, SchemaError> {
        self.models
            .get(name)
            .ok_or_else(|| SchemaError::UnknownModel(name.to_string()))
    }

    pub fn link_definition(&self, model: &str, link: &str) -> Result<&LinkDefinition, SchemaError> {
        self.model(model)?
            .links
            .get(link)
            .ok_or_else(|| SchemaError::UnknownLink {
                model: model.to_string(),
                link: link.to_string(),
            })
    }

    /// The definition of the link on the opposite model that mirrors
    /// `model`/`link`.
    pub fn inverse_link_definition(
        &self,
        model: &str,
        link: &str,
    ) -> Result<&LinkDefinition, SchemaError> {
        let link_def = self.link_definition(model, link)?;
        self.link_definition(&link_def.model, &link_def.inverse)
    }

    pub fn attributes_of(&self, model: &str) -> Result<&[String], SchemaError> {
        Ok(&self.model(model)?.attributes)
    }

    pub fn links_of(&self, model: &str) -> Result<Vec<&str>, SchemaError> {
        Ok(self.model(model)?.links.keys().map(String::as_str).collect())
    }

    /// Checks that every link's target model is declared and that its
    /// declared inverse points back at the owning model.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for (model, definition) in &self.models {
            for (link, link_def) in &definition.links {
                let inverse = self.link_definition(&link_def.model, &link_def.inverse)?;
                if inverse.model != *model {
                    return Err(SchemaError::BrokenInverse {
                        model: model.clone(),
                        link: link.clone(),
                        inverse: link_def.inverse.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
