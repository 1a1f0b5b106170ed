use kube::CustomResourceExt;
use tunnel_agent::crd::Gateway;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&Gateway::crd())?);
    Ok(())
}
