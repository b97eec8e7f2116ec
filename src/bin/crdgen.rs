//! Prints the Yale CRD schemas as YAML, ready for `kubectl apply -f -`.

use anyhow::Result;
use kube::core::CustomResourceExt;
use yale::crd::{AzureClientSecret, GcpSaKey};

fn main() -> Result<()> {
    print!("{}", serde_yaml::to_string(&GcpSaKey::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&AzureClientSecret::crd())?);
    Ok(())
}
