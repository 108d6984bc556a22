//! Print every custom resource definition as YAML, ready for
//! `kubectl apply -f -`.

use kube::CustomResourceExt;

use crds::{ARPTable, Credential, MachineImage, Setting, VirtualMachine};

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&VirtualMachine::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&MachineImage::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&Credential::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&Setting::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&ARPTable::crd())?);
    Ok(())
}
