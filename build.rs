use build_script_cfg::Cfg;
use find_cuda_helper::find_cuda_root;

fn main() {
    println!("cargo:rerun-if-env-changed=CUDA_PATH");
    println!("cargo:rerun-if-env-changed=CUDA_ROOT");

    // 找到 CUDA 时编译 attention::cuda 后端
    let cuda = Cfg::new("cuda");
    if find_cuda_root().is_some() {
        cuda.define()
    }
}
