use std::any::Any;
use std::fmt;
use std::rc::Rc;

pub use worldbase_config::CloneMode;
use worldbase_config::ModelConfig;

/// Visual representation handle owned by a tile, entity type, entity or avatar.
///
/// The world database never looks inside a model; it only clones it per
/// instance and hands it to the scene graph.
pub trait Model: fmt::Debug {
    /// Where the representation came from (file name or generator key).
    fn source(&self) -> &str;

    /// How instances should copy this model.
    fn clone_mode(&self) -> CloneMode;

    /// Copy that shares geometry with `self`.
    fn shallow_clone(&self) -> Box<dyn Model>;

    /// Independent copy.
    fn deep_clone(&self) -> Box<dyn Model>;

    fn as_any(&self) -> &dyn Any;
}

/// Clone a model according to its own clone-mode flag.
pub fn clone_model(model: &dyn Model) -> Box<dyn Model> {
    match model.clone_mode() {
        CloneMode::Shallow => model.shallow_clone(),
        CloneMode::Deep => model.deep_clone(),
    }
}

#[derive(Debug, PartialEq)]
struct Geometry {
    file: String,
}

/// Model backed by a representation file named in configuration.
#[derive(Debug)]
pub struct FileModel {
    geometry: Rc<Geometry>,
    clone_mode: CloneMode,
}

impl FileModel {
    pub fn new(file: impl Into<String>, clone_mode: CloneMode) -> Self {
        Self {
            geometry: Rc::new(Geometry { file: file.into() }),
            clone_mode,
        }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(config.file.clone(), config.clone_mode)
    }

    /// Whether both models share the same geometry instance.
    pub fn shares_geometry_with(&self, other: &FileModel) -> bool {
        Rc::ptr_eq(&self.geometry, &other.geometry)
    }
}

impl Model for FileModel {
    fn source(&self) -> &str {
        &self.geometry.file
    }

    fn clone_mode(&self) -> CloneMode {
        self.clone_mode
    }

    fn shallow_clone(&self) -> Box<dyn Model> {
        Box::new(Self {
            geometry: Rc::clone(&self.geometry),
            clone_mode: self.clone_mode,
        })
    }

    fn deep_clone(&self) -> Box<dyn Model> {
        Box::new(Self {
            geometry: Rc::new(Geometry {
                file: self.geometry.file.clone(),
            }),
            clone_mode: self.clone_mode,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Build the model described by an optional representation entry.
pub fn model_from_config(config: Option<&ModelConfig>) -> Option<Box<dyn Model>> {
    config.map(|c| Box::new(FileModel::from_config(c)) as Box<dyn Model>)
}
