#![deny(unsafe_code)]
//! Prints the `AsyncActor` CRD manifest for installation:
//! `asya-crdgen > deploy/crds/asyncactor.yaml`

use kube::CustomResourceExt;

fn main() {
    let crd = asya_operator::AsyncActor::crd();
    print!(
        "{}",
        serde_yaml::to_string(&crd).expect("CRD serializes to YAML")
    );
}
