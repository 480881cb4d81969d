//! Named parameter storage shared by layers, optimizer and checkpoints.
//!
//! Layers keep only the [`TensorId`] of their weights. The tensors live here,
//! keyed by a stable id, so the optimizer can swap in updated tensors without
//! the layers noticing and checkpoints can address them by dotted name
//! (`"blocks.0.attn.q.weight"`).

use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};
use numr::autograd::Var;
use numr::runtime::Runtime;
use numr::tensor::{Tensor, TensorId};

/// Parameter tensors keyed by stable id, with a name index.
pub struct ParamStore<R: Runtime> {
    tensors: HashMap<TensorId, Tensor<R>>,
    names: BTreeMap<String, TensorId>,
    track_grads: bool,
}

impl<R: Runtime> Default for ParamStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Runtime> ParamStore<R> {
    pub fn new() -> Self {
        Self {
            tensors: HashMap::new(),
            names: BTreeMap::new(),
            track_grads: true,
        }
    }

    /// Register a new parameter under `name`.
    pub fn register(&mut self, name: impl Into<String>, tensor: Tensor<R>) -> Result<TensorId> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(Error::ModelError {
                reason: format!("duplicate parameter name '{name}'"),
            });
        }
        let id = tensor.id();
        self.names.insert(name, id);
        self.tensors.insert(id, tensor);
        Ok(id)
    }

    /// Autograd leaf for a parameter. Gradients are tracked only while
    /// [`ParamStore::set_track_grads`] is on.
    pub fn var(&self, id: TensorId) -> Result<Var<R>> {
        let tensor = self.tensors.get(&id).ok_or_else(|| Error::ModelError {
            reason: format!("unknown parameter id {id:?}"),
        })?;
        Ok(Var::with_id(tensor.clone(), id, self.track_grads))
    }

    pub fn set_track_grads(&mut self, on: bool) {
        self.track_grads = on;
    }

    pub fn track_grads(&self) -> bool {
        self.track_grads
    }

    pub fn get(&self, id: TensorId) -> Option<&Tensor<R>> {
        self.tensors.get(&id)
    }

    pub fn id_of(&self, name: &str) -> Option<TensorId> {
        self.names.get(name).copied()
    }

    /// `(name, id)` pairs in name order.
    pub fn names(&self) -> impl Iterator<Item = (&str, TensorId)> {
        self.names.iter().map(|(n, &id)| (n.as_str(), id))
    }

    /// `(name, tensor)` pairs in name order.
    pub fn named_tensors(&self) -> impl Iterator<Item = (&str, &Tensor<R>)> {
        self.names
            .iter()
            .filter_map(|(n, id)| self.tensors.get(id).map(|t| (n.as_str(), t)))
    }

    /// Raw id -> tensor map, the shape optimizers operate on.
    pub fn tensors_mut(&mut self) -> &mut HashMap<TensorId, Tensor<R>> {
        &mut self.tensors
    }

    pub fn tensors(&self) -> &HashMap<TensorId, Tensor<R>> {
        &self.tensors
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Total scalar parameter count.
    pub fn num_parameters(&self) -> usize {
        self.tensors.values().map(|t| t.numel()).sum()
    }

    /// Replace the tensor behind `name`, keeping its id. Shapes must match.
    pub fn replace(&mut self, name: &str, tensor: Tensor<R>) -> Result<()> {
        let id = self.id_of(name).ok_or_else(|| Error::ModelError {
            reason: format!("unknown parameter '{name}'"),
        })?;
        let current = &self.tensors[&id];
        if current.shape() != tensor.shape() {
            return Err(Error::ModelError {
                reason: format!(
                    "shape mismatch for '{name}': expected {:?}, got {:?}",
                    current.shape(),
                    tensor.shape()
                ),
            });
        }
        self.tensors.insert(id, tensor);
        Ok(())
    }
}
