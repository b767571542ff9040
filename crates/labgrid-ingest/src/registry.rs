//! Template registry — the VM templates available to the VM backend.

use tracing::info;

use labgrid_state::{StateStore, VmTemplate};

use crate::error::{IngestError, IngestResult};

#[derive(Clone)]
pub struct TemplateRegistry {
    store: StateStore,
}

impl TemplateRegistry {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Persist a freshly converted template.
    pub fn register(&self, template: &VmTemplate) -> IngestResult<()> {
        self.store.put_template(template)?;
        info!(
            template_id = %template.id,
            name = %template.name,
            size_bytes = template.size_bytes,
            "template registered"
        );
        Ok(())
    }

    /// All templates, oldest first.
    pub fn list(&self) -> IngestResult<Vec<VmTemplate>> {
        let mut templates = self.store.list_templates()?;
        templates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(templates)
    }

    pub fn get(&self, id: &str) -> IngestResult<VmTemplate> {
        self.store
            .get_template(id)?
            .ok_or_else(|| IngestError::TemplateNotFound(id.to_string()))
    }

    /// Enable or disable booting a template.
    pub fn set_active(&self, id: &str, active: bool) -> IngestResult<VmTemplate> {
        let update = self
            .store
            .update_template(id, |t| {
                if t.active == active {
                    return false;
                }
                t.active = active;
                true
            })
            .map_err(|e| match e {
                labgrid_state::StateError::NotFound(_) => IngestError::TemplateNotFound(id.to_string()),
                other => other.into(),
            })?;
        if update.is_applied() {
            info!(template_id = %id, active, "template activation changed");
        }
        Ok(update.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labgrid_state::TemplateRequirements;

    fn template(id: &str, created_at: u64) -> VmTemplate {
        VmTemplate {
            id: id.to_string(),
            name: format!("tpl {id}"),
            disk_path: format!("/srv/templates/{id}.qcow2"),
            disk_format: "qcow2".to_string(),
            size_bytes: 1024,
            requirements: TemplateRequirements {
                vcpu: 1,
                memory_mb: 1024,
                disk_gb: 10,
            },
            active: true,
            source_upload: None,
            created_at,
        }
    }

    #[test]
    fn list_is_ordered_by_creation() {
        let registry = TemplateRegistry::new(StateStore::open_in_memory().unwrap());
        registry.register(&template("b", 20)).unwrap();
        registry.register(&template("a", 30)).unwrap();
        registry.register(&template("c", 10)).unwrap();

        let ids: Vec<String> = registry.list().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn set_active_toggles() {
        let registry = TemplateRegistry::new(StateStore::open_in_memory().unwrap());
        registry.register(&template("a", 10)).unwrap();

        assert!(!registry.set_active("a", false).unwrap().active);
        assert!(!registry.get("a").unwrap().active);
        assert!(registry.set_active("a", true).unwrap().active);
    }

    #[test]
    fn unknown_template_is_not_found() {
        let registry = TemplateRegistry::new(StateStore::open_in_memory().unwrap());
        assert!(matches!(registry.get("x"), Err(IngestError::TemplateNotFound(_))));
        assert!(matches!(
            registry.set_active("x", true),
            Err(IngestError::TemplateNotFound(_))
        ));
    }
}
