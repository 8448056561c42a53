use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    println!("sycamore {}", env!("CARGO_PKG_VERSION"));
    if !args.extended {
        return Ok(SUCCESS);
    }

    println!("target: {}", option_env!("SYCAMORE_BUILD_TARGET").unwrap_or("unknown"));
    println!("profile: {}", option_env!("SYCAMORE_BUILD_PROFILE").unwrap_or("unknown"));
    println!(
        "features: async={}, sim={}, cli=true",
        cfg!(feature = "async"),
        cfg!(feature = "sim")
    );
    Ok(SUCCESS)
}
