mod application;
mod presentation {
    pub mod cli;
}

use onboard_core::error::Result;

fn main() -> Result<()> {
    application::run()
}
