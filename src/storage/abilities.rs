use anyhow::{Context, Result};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::sync::Arc;

use crate::models::Ability;

const ABILITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("abilities");

/// Catalog of configured abilities. Admin CRUD screens live elsewhere; the
/// engine only needs put/get/list.
#[derive(Clone)]
pub struct AbilityStore {
    db: Arc<Database>,
}

impl AbilityStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(ABILITIES)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    pub fn put(&self, ability: &Ability) -> Result<()> {
        // (provider, capability_key) is the immutable identity; refuse a
        // second ability claiming it.
        if let Some(existing) = self.find(&ability.provider, &ability.capability_key)?
            && existing.id != ability.id
        {
            anyhow::bail!(
                "ability already exists for ({}, {})",
                ability.provider,
                ability.capability_key
            );
        }

        let write_txn = self.db.begin_write().context("begin ability write")?;
        {
            let mut table = write_txn.open_table(ABILITIES)?;
            let serialized = serde_json::to_vec(ability)?;
            table.insert(ability.id.as_str(), serialized.as_slice())?;
        }
        write_txn.commit().context("commit ability")?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Ability>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ABILITIES)?;
        match table.get(id)? {
            Some(data) => Ok(Some(serde_json::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    pub fn find(&self, provider: &str, capability_key: &str) -> Result<Option<Ability>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|a| a.provider == provider && a.capability_key == capability_key))
    }

    pub fn list(&self) -> Result<Vec<Ability>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ABILITIES)?;
        let mut abilities = Vec::new();
        for entry in table.iter()? {
            let (_, data) = entry?;
            abilities.push(serde_json::from_slice(data.value())?);
        }
        Ok(abilities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> AbilityStore {
        let db = Arc::new(
            Database::builder()
                .create_with_backend(redb::backends::InMemoryBackend::new())
                .unwrap(),
        );
        AbilityStore::new(db).unwrap()
    }

    #[test]
    fn test_put_get_roundtrip() {
        let store = setup();
        let ability = Ability::new("txt2img", "comfyui", "image", "txt2img", 10);
        store.put(&ability).unwrap();

        let fetched = store.get(&ability.id).unwrap().unwrap();
        assert_eq!(fetched.capability_key, "txt2img");
        assert_eq!(fetched.cost_points, 10);
    }

    #[test]
    fn test_identity_is_unique() {
        let store = setup();
        store
            .put(&Ability::new("a", "comfyui", "image", "txt2img", 10))
            .unwrap();
        let dup = Ability::new("b", "comfyui", "image", "txt2img", 20);
        assert!(store.put(&dup).is_err());
    }
}
