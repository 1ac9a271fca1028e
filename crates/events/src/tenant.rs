use folio_core::TenantId;

/// Marks types that carry exactly one tenant.
///
/// Projections use this to check that a decoded payload names the same tenant
/// as the stream it was stored under.
pub trait TenantScoped {
    fn tenant_id(&self) -> &TenantId;

    fn belongs_to(&self, tenant_id: &TenantId) -> bool {
        self.tenant_id() == tenant_id
    }
}

