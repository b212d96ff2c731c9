use taskflow_core::{Config, Paths};
use taskflow_storage::ProfileStore;

pub async fn run(force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    paths.ensure_dirs()?;

    let config_path = paths.config_file();
    let config = if config_path.exists() && !force {
        println!("Config already exists: {}", config_path.display());
        Config::load(&config_path)?
    } else {
        let config = Config::default();
        config.save(&config_path)?;
        println!("Wrote config: {}", config_path.display());
        config
    };

    let capabilities_dir = config.capabilities_dir(&paths);
    std::fs::create_dir_all(&capabilities_dir)?;
    println!("Capabilities: {}", capabilities_dir.display());

    let profiles = ProfileStore::new(config.profiles_dir(&paths));
    for name in profiles.ensure_defaults()? {
        println!("Wrote profile: {}", name);
    }

    println!();
    println!("Set model.apiKey in config.json (or TASKFLOW_API_KEY), then run `taskflow chat`.");
    Ok(())
}
