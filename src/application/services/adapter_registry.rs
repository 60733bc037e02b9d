use crate::application::ports::EntityAdapter;
use crate::domain::value_objects::EntityType;
use crate::shared::error::AppError;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// エンティティ種別 → undo/redo アダプタの対応表
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<BTreeMap<EntityType, Arc<dyn EntityAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登録済みの種別を上書きした場合は以前のアダプタを返す
    pub fn register(
        &self,
        entity_type: EntityType,
        adapter: Arc<dyn EntityAdapter>,
    ) -> Option<Arc<dyn EntityAdapter>> {
        debug!(entity_type = %entity_type, "registering entity adapter");
        self.adapters
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(entity_type, adapter)
    }

    pub fn resolve(&self, entity_type: &EntityType) -> Result<Arc<dyn EntityAdapter>, AppError> {
        self.adapters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(entity_type)
            .cloned()
            .ok_or_else(|| AppError::MissingAdapter(entity_type.to_string()))
    }

    pub fn is_registered(&self, entity_type: &EntityType) -> bool {
        self.adapters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(entity_type)
    }

    /// 配線時のチェック。未登録の種別があれば最初の 1 件をエラーにする。
    pub fn ensure_registered(&self, entity_types: &[EntityType]) -> Result<(), AppError> {
        match entity_types.iter().find(|t| !self.is_registered(t)) {
            Some(missing) => Err(AppError::MissingAdapter(missing.to_string())),
            None => Ok(()),
        }
    }

    pub fn registered_types(&self) -> Vec<EntityType> {
        self.adapters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}
