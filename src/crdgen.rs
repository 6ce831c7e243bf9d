use kube::CustomResourceExt;
use operator::apis::authproxyworkload_types::AuthProxyWorkload;

fn main() {
    let crd = AuthProxyWorkload::crd();
    print!("{}", serde_yaml::to_string(&crd).unwrap())
}
