use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::trainer::TrainingSet;
use rollcall_core::{Config, DetectorCascade, FaceSize, IdentityGallery, LbphParams, LbphRecognizer};
use rollcall_hw::Camera;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rollcall", about = "rollcall face attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the recognizer from dataset/<person>/*.jpg
    Train {
        /// Directory with one sub-folder of face images per person [default: from config]
        #[arg(short, long)]
        dataset: Option<PathBuf>,
        /// Where trainer.json and labels.txt are written [default: from config]
        #[arg(short, long)]
        trainer_dir: Option<PathBuf>,
        /// Canonical face size, WIDTHxHEIGHT [default: from config]
        #[arg(short, long)]
        face_size: Option<FaceSize>,
    },
    /// List V4L2 capture devices
    Devices,
    /// Check that detector definitions and trained artifacts load
    Check {
        /// Directory holding the three Haar cascade XML files [default: from config]
        #[arg(short, long)]
        models: Option<PathBuf>,
        /// Directory holding trainer.json and labels.txt [default: from config]
        #[arg(short, long)]
        trainer_dir: Option<PathBuf>,
    },
}

impl Commands {
    /// Fold command-line overrides into the daemon's configuration.
    fn apply_to(&self, config: &mut Config) {
        let set = |slot: &mut Option<PathBuf>, value: &Option<PathBuf>| {
            if value.is_some() {
                slot.clone_from(value);
            }
        };
        match self {
            Commands::Train {
                dataset,
                trainer_dir,
                face_size,
            } => {
                set(&mut config.dataset_dir, dataset);
                set(&mut config.trainer_dir, trainer_dir);
                if let Some(size) = face_size {
                    config.face_size = *size;
                }
            }
            Commands::Check { models, trainer_dir } => {
                set(&mut config.model_dir, models);
                set(&mut config.trainer_dir, trainer_dir);
            }
            Commands::Devices => {}
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Train { .. } => train(&load_config(&cli.command)?),
        Commands::Check { .. } => check(&load_config(&cli.command)?),
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} (driver {}, bus {})", d.path, d.name, d.driver, d.bus);
            }
            Ok(())
        }
    }
}

/// The same configuration the daemon reads, with `command`'s flags on top.
fn load_config(command: &Commands) -> Result<Config> {
    let mut config = Config::load().context("failed to load configuration")?;
    command.apply_to(&mut config);
    Ok(config)
}

fn train(config: &Config) -> Result<()> {
    let dataset = config.dataset_dir();
    let face_size = config.face_size;
    let set = TrainingSet::collect(&dataset, face_size)
        .with_context(|| format!("cannot read dataset {}", dataset.display()))?;
    println!(
        "Found {} people, {} images ({} skipped)",
        set.gallery.len(),
        set.faces.len(),
        set.skipped
    );

    let model = set.train(LbphParams::default(), face_size).context("training failed")?;

    let model_path = config.model_path();
    let labels_path = config.labels_path();
    model
        .save(&model_path)
        .with_context(|| format!("cannot write {}", model_path.display()))?;
    set.gallery
        .save(&labels_path)
        .with_context(|| format!("cannot write {}", labels_path.display()))?;

    tracing::info!(
        model = %model_path.display(),
        labels = %labels_path.display(),
        identities = set.gallery.len(),
        "training complete"
    );
    println!("Model saved: {}", model_path.display());
    println!("Labels saved: {}", labels_path.display());
    Ok(())
}

/// Run the daemon's startup checks without opening a camera.
fn check(config: &Config) -> Result<()> {
    let models = config.model_dir();
    DetectorCascade::load(&models, config.detection_params())
        .with_context(|| format!("detector definitions in {}", models.display()))?;
    println!("detectors: ok ({})", models.display());

    let recognizer = LbphRecognizer::load(&config.model_path()).context("trained model")?;
    if recognizer.face_size() != config.face_size {
        bail!(
            "trained model uses face size {} but face_size is {} — retrain or change the setting",
            recognizer.face_size(),
            config.face_size
        );
    }
    println!("model: ok (face size {})", recognizer.face_size());

    let gallery = IdentityGallery::load(&config.labels_path()).context("label mapping")?;
    println!("labels: ok ({} identities)", gallery.len());
    for identity in gallery.iter() {
        println!("  {:>3}  {}", identity.id, identity.name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    fn config_under(root: &std::path::Path) -> Config {
        Config {
            data_dir: root.to_path_buf(),
            face_size: FaceSize::new(32, 32),
            ..Config::default()
        }
    }

    #[test]
    fn test_train_parses_face_size() {
        let cli = Cli::try_parse_from(["rollcall", "train", "--face-size", "100x120"]).unwrap();
        match cli.command {
            Commands::Train { face_size, dataset, .. } => {
                assert_eq!(face_size, Some(FaceSize::new(100, 120)));
                assert_eq!(dataset, None);
            }
            _ => panic!("expected train"),
        }
        assert!(Cli::try_parse_from(["rollcall", "train", "--face-size", "big"]).is_err());
    }

    #[test]
    fn test_paths_default_to_config() {
        let mut config = Config {
            data_dir: PathBuf::from("/srv/rollcall"),
            face_size: FaceSize::new(120, 120),
            trainer_dir: Some(PathBuf::from("/var/lib/rollcall/trainer")),
            ..Config::default()
        };
        let cli = Cli::try_parse_from(["rollcall", "train"]).unwrap();
        cli.command.apply_to(&mut config);
        assert_eq!(config.dataset_dir(), PathBuf::from("/srv/rollcall/dataset"));
        assert_eq!(config.model_path(), PathBuf::from("/var/lib/rollcall/trainer/trainer.json"));
        assert_eq!(config.face_size, FaceSize::new(120, 120));

        let cli = Cli::try_parse_from(["rollcall", "check", "--models", "/opt/cascades"]).unwrap();
        cli.command.apply_to(&mut config);
        assert_eq!(config.model_dir(), PathBuf::from("/opt/cascades"));
        assert_eq!(config.labels_path(), PathBuf::from("/var/lib/rollcall/trainer/labels.txt"));
    }

    #[test]
    fn test_train_flags_override_config() {
        let mut config = config_under(std::path::Path::new("/srv/rollcall"));
        let cli = Cli::try_parse_from(["rollcall", "train", "-d", "faces", "-t", "out", "-f", "64x64"]).unwrap();
        cli.command.apply_to(&mut config);
        assert_eq!(config.dataset_dir(), PathBuf::from("faces"));
        assert_eq!(config.trainer_dir(), PathBuf::from("out"));
        assert_eq!(config.face_size, FaceSize::new(64, 64));
    }

    #[test]
    fn test_train_then_check_artifacts() {
        let root = tempfile::tempdir().unwrap();
        let dataset = root.path().join("dataset");
        for (person, shade) in [("Asha", 40u8), ("Ravi", 180u8)] {
            let dir = dataset.join(person);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..6u32 {
                image::GrayImage::from_fn(48, 48, |x, y| image::Luma([shade.wrapping_add(((x + i) * y) as u8)]))
                    .save(dir.join(format!("{i}.png")))
                    .unwrap();
            }
        }
        let trainer_dir = root.path().join("trainer");
        let config = config_under(root.path());

        train(&config).unwrap();

        let recognizer = LbphRecognizer::load(&trainer_dir.join("trainer.json")).unwrap();
        assert_eq!(recognizer.face_size(), FaceSize::new(32, 32));
        let gallery = IdentityGallery::load(&trainer_dir.join("labels.txt")).unwrap();
        assert_eq!(gallery.get(1).map(|i| i.name.as_str()), Some("Ravi"));

        // No cascade XML files in this tree.
        let err = check(&config).unwrap_err();
        assert!(format!("{err:#}").contains(&root.path().join("models").display().to_string()));
    }
}
