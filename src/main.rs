use std::env;
use std::path::PathBuf;

use futures::StreamExt;
use log::{LevelFilter, error, info};
use simple_logger::SimpleLogger;

use svr_volume::{
    Bounds, CancellationToken, DicomSource, InMemorySource, ReconstructionOptions, SeriesInput, Vec3,
    enums::Orientation,
    phantom::{BlobPhantom, CompositePhantom, CubePhantom, orthogonal_stacks},
    spawn_reconstruction,
};

const USAGE: &str = "usage: svr-volume <dicom-dir | --phantom> [options.json] [output-prefix]";

fn phantom_input() -> (InMemorySource, Vec<SeriesInput>) {
    let bounds = Bounds::new(Vec3::zeros(), Vec3::repeat(63.0));
    let phantom = CompositePhantom(vec![
        Box::new(CubePhantom {
            bounds: Bounds::new(Vec3::new(12.0, 16.0, 20.0), Vec3::new(40.0, 36.0, 44.0)),
            intensity: 400.0,
        }),
        Box::new(BlobPhantom {
            center: Vec3::new(36.0, 30.0, 28.0),
            radii_mm: Vec3::new(10.0, 8.0, 14.0),
            peak: 600.0,
            background: 50.0,
        }),
    ]);
    orthogonal_stacks(&phantom, &bounds, 1.0, 4.0, 4.0)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .env()
        .init()
        .expect("should have installed the logger");

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(input) = args.first() else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };
    let options = match args.get(1) {
        Some(path) => ReconstructionOptions::from_json_file(path).expect("should have read the options file"),
        None => ReconstructionOptions::default(),
    };
    let prefix = args.get(2).cloned().unwrap_or_else(|| "result".to_string());

    let mut handle = if input == "--phantom" {
        let (source, inputs) = phantom_input();
        spawn_reconstruction(source, inputs, options, CancellationToken::new())
    } else {
        let (source, inputs) = DicomSource::load_from_directory(PathBuf::from(input))
            .expect("should have loaded files from directory");
        spawn_reconstruction(source, inputs, options, CancellationToken::new())
    };

    while let Some(progress) = handle.progress.next().await {
        info!(
            "[{:?} {}/{}] {}",
            progress.phase, progress.current, progress.total, progress.message
        );
    }

    let output = match handle.join().await {
        Ok(output) => output,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let (nz, ny, nx) = output.volume.dim();
    for (orientation, index, name) in [
        (Orientation::Axial, nz / 2, "axial"),
        (Orientation::Coronal, ny / 2, "coronal"),
        (Orientation::Sagittal, nx / 2, "sagittal"),
    ] {
        let image = output
            .volume
            .get_image_from_axis(index, &orientation)
            .expect("should have returned image at center of volume");
        let path = format!("{prefix}_{name}.png");
        image.save(&path).expect("should have written the image");
        info!("Wrote {path}");
    }
}
