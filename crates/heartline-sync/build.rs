//! 编译期生成 GIT_SHA、BUILD_TIMESTAMP 等元信息（供 version.rs 使用）

use vergen::EmitBuilder;

fn main() {
    // 源码包（非 git 仓库）构建时拿不到 git 信息，给出占位值
    if EmitBuilder::builder()
        .build_timestamp()
        .git_sha(false)
        .emit()
        .is_err()
    {
        println!("cargo:rustc-env=VERGEN_BUILD_TIMESTAMP=unknown");
        println!("cargo:rustc-env=VERGEN_GIT_SHA=unknown");
    }
}
