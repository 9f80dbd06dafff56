use edgenet_snm::crd::subnamespace::SubNamespace;
use edgenet_snm::crd::tenant::{SliceClaim, Tenant, TenantResourceQuota};
use kube::core::CustomResourceExt;

fn main() {
    for crd in [
        SubNamespace::crd(),
        Tenant::crd(),
        TenantResourceQuota::crd(),
        SliceClaim::crd(),
    ] {
        let yaml = serde_yaml::to_string(&crd).expect("serialize CRD to YAML");
        println!("---\n{}", yaml);
    }
}
