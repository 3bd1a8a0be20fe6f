use krill_core::{DesiredObject, ObjectKind, Result, Role, GROUP_DATA, GROUP_METADATA};
use serde_json::json;

use crate::{BuildContext, RoleBuilder};

pub const CA_SECRET_SUFFIX: &str = "cluster-ca-cert";

/// Cluster CA certificate secret. Material comes from the credential provider and is copied
/// verbatim; nothing is emitted until the provider has issued it.
pub struct CredentialsBuilder;

impl RoleBuilder for CredentialsBuilder {
    fn role(&self) -> Role { Role::Cluster }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<Vec<DesiredObject>> {
        let Some(ca) = &ctx.defaults.cluster_ca else { return Ok(Vec::new()) };
        let name = ctx.name(CA_SECRET_SUFFIX);
        let data = json!(ca.data);
        let manifest = json!({
            "apiVersion": ObjectKind::Secret.api_version(),
            "kind": ObjectKind::Secret.kind(),
            "metadata": ctx.metadata(&name, Role::Cluster),
            "type": "Opaque",
            "data": data,
        });
        let labels = ctx.labels(Role::Cluster);
        Ok(vec![DesiredObject::seal(
            ctx.object_ref(ObjectKind::Secret, CA_SECRET_SUFFIX),
            Role::Cluster,
            manifest,
            vec![(GROUP_METADATA, &labels), (GROUP_DATA, &data)],
            None,
        )])
    }
}
