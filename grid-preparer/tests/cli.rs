use std::path::{Path, PathBuf};
use std::process::Command;

use pretty_assertions::assert_eq;

const REFERENCE: &str = "SABAP2_number,SA_name,Scientific_name,ebirds_name\n\
7,Spotted Eagle-Owl,Bubo africanus,Bubo africanus\n\
12,Cape Sparrow,Passer melanurus,Passer melanurus\n";

const MASTER_GRID: &str = "pentad\n3355_1825\n2540_2810\n2950_3100\n";

fn run(args: &[&str]) -> String {
    let output = Command::new(env!("CARGO_BIN_EXE_grid-preparer"))
        .args(args)
        .output()
        .expect("failed to start grid-preparer");
    assert!(
        output.status.success(),
        "grid-preparer {args:?} failed:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap()
}

fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}

fn s(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn cell_encodes_and_decodes() {
    assert_eq!(run(&["cell", "--latitude", "-33.92", "--longitude", "18.42"]).trim(), "3355_1825");
    let decoded = run(&["cell", "--decode", "3355_1825"]);
    assert!(decoded.contains("-33.91"), "{decoded}");
}

#[test]
fn observations_to_training_rows() {
    let dir = tempfile::tempdir().unwrap();
    let d = dir.path();
    let reference = write(d, "birds.csv", REFERENCE);
    let master = write(d, "pentads.csv", MASTER_GRID);
    let verified_export = write(
        d,
        "ebird.tsv",
        "species\tdecimalLatitude\tdecimalLongitude\n\
         Bubo africanus\t-33.92\t18.42\n\
         Passer melanurus\t-33.92\t18.42\n\
         Corvus albus\t-29.86\t31.02\n\
         Corvus albus\t-29.86\t31.02\n\
         Corvus albus\t-29.86\t31.02\n",
    );
    let unverified_export = write(
        d,
        "inat.tsv",
        "species\tdecimalLatitude\tdecimalLongitude\nPasser melanurus\t-25.70\t28.20\n",
    );
    let covariates = write(d, "cov.csv", "pentad,rain\n3355_1825,1\n2540_2810,3\n2950_3100,2\n");

    let ebird = d.join("ebird.pbm.gz");
    let inat = d.join("inat.csv");
    for (export, out) in [(&verified_export, &ebird), (&unverified_export, &inat)] {
        run(&[
            "aggregate",
            s(export),
            "--reference",
            s(&reference),
            "--master-grid",
            s(&master),
            "--name-column",
            "ebirds_name",
            "--batch-size",
            "2",
            "-o",
            s(out),
        ]);
    }

    let verified = d.join("verified.csv");
    run(&["combine", s(&ebird), "-o", s(&verified)]);
    assert_eq!(
        std::fs::read_to_string(&verified).unwrap(),
        "pentad,7,12,0,total_pentad_observations\n\
         3355_1825,1,1,0,2\n\
         2540_2810,0,0,0,0\n\
         2950_3100,0,0,3,3\n"
    );

    let unverified = d.join("unverified.csv");
    run(&["combine", s(&inat), "-o", s(&unverified)]);

    let scaled = d.join("scaled.csv");
    run(&["prepare-covariates", s(&covariates), "-o", s(&scaled)]);

    let labels = d.join("labels");
    run(&[
        "label",
        "--verified",
        s(&verified),
        "--unverified",
        s(&unverified),
        "--covariates",
        s(&scaled),
        "--species",
        "7",
        "--min-presence-observations",
        "1",
        "-o",
        s(&labels),
    ]);

    // threshold 2: 2950_3100 has enough effort, 2540_2810 has none
    let rows = std::fs::read_to_string(labels.join("7.csv")).unwrap();
    let targets: Vec<&str> = rows
        .lines()
        .skip(1)
        .map(|line| line.rsplit(',').next().unwrap())
        .collect();
    assert_eq!(targets, ["1", "-1", "0"]);
}

#[test]
fn presence_guard_skips_species_without_failing() {
    let dir = tempfile::tempdir().unwrap();
    let d = dir.path();
    let matrix = write(d, "verified.csv", "pentad,7,0\n3355_1825,1,0\n");
    let covariates = write(d, "cov.csv", "pentad,rain\n3355_1825,0\n");
    let labels = d.join("labels");
    run(&[
        "label",
        "--verified",
        s(&matrix),
        "--unverified",
        s(&matrix),
        "--covariates",
        s(&covariates),
        "--species",
        "7",
        "-o",
        s(&labels),
    ]);
    assert!(!labels.join("7.csv").exists());
}
