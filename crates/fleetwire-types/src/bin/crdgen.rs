//! Prints the custom resource definitions as YAML, for applying to the
//! cluster before the server starts.

use kube::CustomResourceExt;

use fleetwire_types::{Device, WireguardIp, WireguardIpPool};

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [
        Device::crd(),
        WireguardIp::crd(),
        WireguardIpPool::crd(),
    ];
    for crd in crds {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
