use taskflow_core::{Config, Paths};
use taskflow_storage::ProfileStore;

pub async fn list() -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let store = ProfileStore::new(config.profiles_dir(&paths));
    let names = store.list()?;

    if names.is_empty() {
        println!("No profiles found. Run `taskflow init` first.");
        return Ok(());
    }

    for name in names {
        let marker = if name == config.engine.default_profile { "*" } else { " " };
        match store.load(&name) {
            Ok(profile) => println!(
                "{} {:<18} planner={} replier={} capabilities={}",
                marker,
                name,
                profile.planner,
                profile.replier,
                profile.patterns().join(",")
            ),
            Err(e) => println!("{} {:<18} (unreadable: {})", marker, name, e),
        }
    }
    Ok(())
}
