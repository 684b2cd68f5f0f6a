use ovs_mesh_controller_core::CatalogEntry;

/// Chooses the single instance that an upstream binding is redirected to.
///
/// Each binding maps to exactly one flow target, so a strategy that spreads connections over
/// several instances needs a group action rather than a different choice here.
pub trait SelectDestination: Send + Sync {
    fn select<'e>(&self, entries: &'e [CatalogEntry]) -> Option<&'e CatalogEntry>;
}

/// Selects the first instance in the registry's order.
///
/// This is deterministic for a stable registry response; it does not balance load.
#[derive(Copy, Clone, Debug, Default)]
pub struct FirstEntry;

impl SelectDestination for FirstEntry {
    fn select<'e>(&self, entries: &'e [CatalogEntry]) -> Option<&'e CatalogEntry> {
        entries.first()
    }
}
