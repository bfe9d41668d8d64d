fn main() {
    println!("cargo:rerun-if-changed=./iomux.proto");
    tonic_build::compile_protos("./iomux.proto")
        .unwrap_or_else(|err| panic!("Failed to compile protos {:?}", err));
}
