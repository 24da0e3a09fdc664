use std::{
    any::{Any, TypeId},
    sync::Arc,
};

use qinglian_core::common::error::{Error, Result};

/// 一个节点上所有已置标志位的位掩码
pub type StateMask = u64;

/// Dynamically typed per-node field value. Subscribers receive clones of
/// the `Arc`, never shared mutable state.
pub type FieldValue = Arc<dyn Any + Send + Sync>;

pub(crate) type FieldEncoder = Arc<dyn Fn(&FieldValue) -> Result<Vec<u8>> + Send + Sync>;
pub(crate) type FieldDecoder = Arc<dyn Fn(&[u8]) -> Result<FieldValue> + Send + Sync>;

/// Named boolean node attribute. Flags are registered with the state
/// machine before start; persistent flags survive restarts.
#[derive(Clone, Debug)]
pub struct FlagDef {
    name: String,
    persistent: bool,
}

impl FlagDef {
    pub fn new(name: &str) -> FlagDef {
        FlagDef {
            name: name.to_owned(),
            persistent: false,
        }
    }

    pub fn persistent(name: &str) -> FlagDef {
        FlagDef {
            name: name.to_owned(),
            persistent: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }
}

/// Named typed node attribute. Persistent fields carry an encoder/decoder
/// pair; their stored form is keyed by name so that registration order is
/// a free parameter.
#[derive(Clone)]
pub struct FieldDef {
    name: String,
    type_id: TypeId,
    type_name: &'static str,
    codec: Option<(FieldEncoder, FieldDecoder)>,
}

impl FieldDef {
    pub fn new<T: Any + Send + Sync>(name: &str) -> FieldDef {
        FieldDef {
            name: name.to_owned(),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            codec: None,
        }
    }

    pub fn persistent<T, E, D>(name: &str, encode: E, decode: D) -> FieldDef
    where
        T: Any + Send + Sync,
        E: Fn(&T) -> Result<Vec<u8>> + Send + Sync + 'static,
        D: Fn(&[u8]) -> Result<T> + Send + Sync + 'static,
    {
        let type_name = std::any::type_name::<T>();
        let enc: FieldEncoder = Arc::new(move |value: &FieldValue| {
            let typed = value.as_ref().downcast_ref::<T>().ok_or_else(|| {
                Error::new_invalid_field(&format!("Field encoder expects {}", type_name))
            })?;
            encode(typed)
        });
        let dec: FieldDecoder =
            Arc::new(move |bytes: &[u8]| Ok(Arc::new(decode(bytes)?) as FieldValue));

        FieldDef {
            name: name.to_owned(),
            type_id: TypeId::of::<T>(),
            type_name,
            codec: Some((enc, dec)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_persistent(&self) -> bool {
        self.codec.is_some()
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub(crate) fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn codec(&self) -> Option<&(FieldEncoder, FieldDecoder)> {
        self.codec.as_ref()
    }

    pub(crate) fn check_type(&self, value: &FieldValue) -> bool {
        value.as_ref().type_id() == self.type_id
    }
}

impl std::fmt::Debug for FieldDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldDef")
            .field("name", &self.name)
            .field("type", &self.type_name)
            .field("persistent", &self.is_persistent())
            .finish()
    }
}
