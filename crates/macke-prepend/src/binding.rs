//! Variable binding: which parameter of the target a vector object describes.

use std::collections::BTreeMap;

use macke_ir::{IrParam, IrType, IrValueId};
use macke_ktest::{KTestObject, TestVector};
use serde::Serialize;

use crate::error::SynthesisError;
use crate::whitelist::is_exempt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundParam {
    pub value: IrValueId,
    pub ty: IrType,
}

/// Why a vector was left out of the shadow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The ktest was unreadable or its provenance is otherwise doubtful.
    HadError,
    UnboundObject { object: String },
}

/// Named parameters of one function, keyed by source-level name.
#[derive(Debug, Clone, Default)]
pub struct ParamBindings {
    by_name: BTreeMap<String, BoundParam>,
}

impl ParamBindings {
    /// Parameters without a name never bind. If two parameters share a name
    /// the later one wins.
    pub fn new(params: &[IrParam]) -> Self {
        let mut by_name = BTreeMap::new();
        for (index, param) in params.iter().enumerate() {
            if let Some(name) = &param.name {
                by_name.insert(
                    name.clone(),
                    BoundParam {
                        value: IrValueId(index as u32),
                        ty: param.ty,
                    },
                );
            }
        }
        Self { by_name }
    }

    pub fn get(&self, name: &str) -> Option<BoundParam> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// A vector is admissible when it loaded cleanly and every object it
    /// names is either exempt or a parameter.
    pub fn admissibility(&self, vector: &TestVector) -> Result<(), SkipReason> {
        if vector.had_error {
            return Err(SkipReason::HadError);
        }
        match vector
            .object_names()
            .find(|name| !is_exempt(name) && !self.by_name.contains_key(*name))
        {
            Some(object) => Err(SkipReason::UnboundObject {
                object: object.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// The non-exempt objects of `vector` paired with their parameters, in
    /// vector order.
    pub fn bind<'v>(
        &self,
        function: &str,
        vector: &'v TestVector,
    ) -> Result<Vec<(&'v KTestObject, BoundParam)>, SynthesisError> {
        vector
            .objects
            .iter()
            .filter(|object| !is_exempt(&object.name))
            .map(|object| {
                self.get(&object.name)
                    .map(|param| (object, param))
                    .ok_or_else(|| SynthesisError::UnboundObject {
                        function: function.to_string(),
                        object: object.name.clone(),
                    })
            })
            .collect()
    }
}
