use std::error::Error;
use vergen::EmitBuilder;

fn main() -> Result<(), Box<dyn Error>> {
    // Try to get the git sha from the local git repository. If unable to get
    // the git sha fall back to the GIT_SHA env variable.
    if EmitBuilder::builder()
        .fail_on_error()
        .git_sha(false)
        .emit()
        .is_err()
    {
        if let Ok(sha) = std::env::var("GIT_SHA") {
            println!("cargo:rustc-env=VERGEN_GIT_SHA={sha}");
        }
    }

    // Emit the instructions
    EmitBuilder::builder().all_cargo().all_rustc().emit()?;
    Ok(())
}
