use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListObjectType {
    #[serde(rename = "list")]
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelObjectType {
    #[serde(rename = "model")]
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// The model identifier, which can be referenced in the API endpoints.
    pub id: String,
    /// The object type, which is always "model".
    pub object: ModelObjectType,
    /// The Unix timestamp (in seconds) when the model was created.
    pub created: i64,
    /// The organization that owns the model.
    pub owned_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListModelsResponse {
    /// The object type, which is always "list".
    pub object: ListObjectType,
    /// The list of model objects.
    pub data: Vec<Model>,
}

impl ListModelsResponse {
    pub fn from_catalog<I, S>(models: I, created: i64, owned_by: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            object: ListObjectType::List,
            data: models
                .into_iter()
                .map(|id| Model {
                    id: id.into(),
                    object: ModelObjectType::Model,
                    created,
                    owned_by: owned_by.to_string(),
                })
                .collect(),
        }
    }
}
