use indexmap::IndexMap;

use crate::errors::RunError;

/// Which adapter implementation serves a generation model id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorFamily {
    ComfyUi,
    Bfl,
    Dryrun,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorSpec {
    pub name: String,
    pub family: GeneratorFamily,
    pub width: u32,
    pub height: u32,
}

/// Insertion-ordered map of generation model id to its fixed configuration.
///
/// Resolution happens once at startup; adapters never re-inspect model name
/// strings at call sites.
#[derive(Debug, Clone)]
pub struct GeneratorRegistry {
    models: IndexMap<String, GeneratorSpec>,
}

impl GeneratorRegistry {
    pub fn new(models: Option<IndexMap<String, GeneratorSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_generators),
        }
    }

    pub fn get(&self, name: &str) -> Option<&GeneratorSpec> {
        self.models.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    pub fn resolve(&self, name: &str) -> Result<&GeneratorSpec, RunError> {
        self.get(name).ok_or_else(|| RunError::UnknownModel {
            requested: name.to_string(),
            available: self.names(),
        })
    }
}

impl Default for GeneratorRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

fn default_generators() -> IndexMap<String, GeneratorSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, family: GeneratorFamily, width: u32, height: u32| {
        map.insert(
            name.to_string(),
            GeneratorSpec {
                name: name.to_string(),
                family,
                width,
                height,
            },
        );
    };

    insert("comfyui-flux", GeneratorFamily::ComfyUi, 1216, 832);
    insert("comfyui-flux-krea", GeneratorFamily::ComfyUi, 1024, 1024);
    insert("comfyui-z-image-turbo", GeneratorFamily::ComfyUi, 1024, 1024);
    insert("flux-dev", GeneratorFamily::Bfl, 1216, 832);
    insert("flux-pro", GeneratorFamily::Bfl, 1216, 832);
    insert("flux-pro-1.1", GeneratorFamily::Bfl, 1216, 832);
    insert("flux-pro-1.1-ultra", GeneratorFamily::Bfl, 1216, 832);
    insert("flux-2-flex", GeneratorFamily::Bfl, 1216, 832);
    insert("flux-2-pro", GeneratorFamily::Bfl, 1216, 832);
    insert("flux-2-max", GeneratorFamily::Bfl, 1216, 832);
    insert("dryrun", GeneratorFamily::Dryrun, 1216, 832);

    map
}

/// Which refine adapter serves a refine-model id.
///
/// Known local ids map to a vision model tag on the local inference server;
/// any other id is passed through to the hosted chat API as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefinerSelection {
    Local { name: String, model_tag: String },
    Hosted { model: String },
}

impl RefinerSelection {
    pub fn name(&self) -> &str {
        match self {
            RefinerSelection::Local { name, .. } => name,
            RefinerSelection::Hosted { model } => model,
        }
    }
}

const LOCAL_REFINERS: [(&str, &str); 3] = [
    ("local-llava", "llava:13b"),
    ("local-llama-vision", "llama3.2-vision:11b"),
    ("local-qwen-vl", "qwen2.5vl:7b"),
];

pub fn resolve_refiner(name: &str) -> RefinerSelection {
    for (id, tag) in LOCAL_REFINERS {
        if id == name {
            return RefinerSelection::Local {
                name: name.to_string(),
                model_tag: tag.to_string(),
            };
        }
    }
    RefinerSelection::Hosted {
        model: name.to_string(),
    }
}
