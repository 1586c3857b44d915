use std::{
    fs::{create_dir_all, File},
    io::Write,
    path::{Path, PathBuf},
};

use vtkio::model::*;

use crate::{floating_type_mod::FT, Snapshot, SimulationError, V3};

const KIND_PARTICLE: u8 = 0;
const KIND_FRAGMENT: u8 = 1;
const KIND_INTACT_BODY: u8 = 2;

/// Writes one legacy VTK poly-data file per snapshot plus a `.vtk.series` index for ParaView.
pub(crate) struct VtkExporter {
    /// something like './data' and 'sph' which will get expanded to './data/sph-00001.vtk' and './data/sph.vtk.series'
    folder: PathBuf,
    basename: String,
    snapshot_number: usize,
    series_file: File,
}

impl VtkExporter {
    pub(crate) fn new(folder: impl Into<PathBuf>, basename: impl Into<String>) -> Result<VtkExporter, SimulationError> {
        let folder: PathBuf = folder.into();
        let basename: String = basename.into();

        create_dir_all(&folder)?;

        let mut series_file = File::create(folder.join(format!("{}.vtk.series", basename)))?;
        let series_prelude_str = "{\n\"file-series-version\": \"1.0\",\n\"files\": [";
        series_file.write_all(series_prelude_str.as_bytes())?;

        Ok(VtkExporter {
            series_file,
            folder,
            basename,
            snapshot_number: 1,
        })
    }

    pub(crate) fn add_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), SimulationError> {
        if self.snapshot_number > 1 {
            self.series_file.write_all(",".as_bytes())?;
        }

        let vtk_filename = format!("{}-{:05}.vtk", self.basename, self.snapshot_number);
        write_snapshot(self.folder.join(&vtk_filename), snapshot)?;

        write!(
            self.series_file,
            "\n{{ \"name\": \"{}\", \"time\": {} }}",
            vtk_filename, snapshot.time
        )?;

        self.snapshot_number += 1;
        Ok(())
    }
}

impl Drop for VtkExporter {
    fn drop(&mut self) {
        let series_end_str = "\n]\n}";
        let _ = self.series_file.write_all(series_end_str.as_bytes());
    }
}

#[derive(Default)]
struct PolyBuilder {
    points: Vec<V3>,
    kind: Vec<u8>,
    object_id: Vec<i32>,
    polys: Vec<u32>,
    num_polys: u32,
}

impl PolyBuilder {
    fn add_polygon(&mut self, vertices: impl Iterator<Item = V3>, kind: u8, object_id: i32) {
        let start = self.polys.len();
        self.polys.push(0);
        for v in vertices {
            self.polys.push(self.points.len() as u32);
            self.points.push(v);
            self.kind.push(kind);
            self.object_id.push(object_id);
        }
        self.polys[start] = (self.polys.len() - start - 1) as u32;
        self.num_polys += 1;
    }
}

/**
 * Particles become vertex cells, fragments and intact bodies one polygon
 * per face. Point attributes `kind` (0 particle, 1 fragment, 2 intact body)
 * and `object_id` (fragment or body id, -1 for particles) tell them apart.
 */
fn write_snapshot(path: impl AsRef<Path>, snapshot: &Snapshot) -> Result<(), SimulationError> {
    let num_particles = snapshot.particle_positions.len();

    let mut builder = PolyBuilder {
        points: snapshot.particle_positions.clone(),
        kind: vec![KIND_PARTICLE; num_particles],
        object_id: vec![-1; num_particles],
        ..PolyBuilder::default()
    };

    for fragment in &snapshot.fragments {
        for face in fragment.mesh.faces() {
            builder.add_polygon(
                face.iter().map(|v| fragment.position + fragment.orientation * *v),
                KIND_FRAGMENT,
                fragment.id.0 as i32,
            );
        }
    }
    for body in &snapshot.intact_bodies {
        for face in body.mesh.faces() {
            builder.add_polygon(face.iter().copied(), KIND_INTACT_BODY, body.id as i32);
        }
    }

    let vtk_verts: Vec<u32> = (0..num_particles).flat_map(|i| [1, i as u32]).collect();
    let vtk_points: Vec<FT> = builder.points.iter().flat_map(|x| [x.x, x.y, x.z]).collect();

    let mut kind = DataArray::scalars("kind", 1);
    kind.data = builder.kind.into();
    let mut object_id = DataArray::scalars("object_id", 1);
    object_id.data = builder.object_id.into();

    let path = path.as_ref().to_path_buf();
    let vtk = Vtk {
        version: Version::new((4, 2)),
        byte_order: ByteOrder::BigEndian,
        title: format!("SPH fracture step {}", snapshot.step),
        file_path: Some(path.clone()),
        data: DataSet::PolyData {
            meta: None,
            pieces: vec![Piece::Inline(Box::new(PolyDataPiece {
                points: vtk_points.into(),
                verts: (num_particles > 0).then(|| VertexNumbers::Legacy {
                    num_cells: num_particles as u32,
                    vertices: vtk_verts,
                }),
                polys: (builder.num_polys > 0).then(|| VertexNumbers::Legacy {
                    num_cells: builder.num_polys,
                    vertices: builder.polys,
                }),
                data: Attributes {
                    cell: Vec::new(),
                    point: vec![Attribute::DataArray(kind), Attribute::DataArray(object_id)],
                },
                ..Default::default()
            }))],
        },
    };

    vtk.export(&path).map_err(|err| {
        SimulationError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("failed writing {}: {:?}", path.display(), err),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{scene::SceneConfig, simulation_parameters::SimulationParams, vec3f, SimulationClock};

    #[test]
    fn polygons_reference_their_own_points() {
        let mut builder = PolyBuilder::default();
        builder.add_polygon([V3::zeros(), V3::x(), V3::y()].into_iter(), KIND_FRAGMENT, 3);
        builder.add_polygon([V3::zeros(), V3::x(), V3::y(), V3::z()].into_iter(), KIND_INTACT_BODY, 0);
        assert_eq!(builder.num_polys, 2);
        assert_eq!(builder.polys, vec![3, 0, 1, 2, 4, 3, 4, 5, 6]);
        assert_eq!(builder.kind, vec![1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn writes_files_and_series() {
        let dir = std::env::temp_dir().join(format!("sph-fracture-vtk-{}", std::process::id()));
        let params = SimulationParams {
            backend: crate::simulation_parameters::BackendType::Serial,
            ..SimulationParams::default()
        };
        let mut clock = SimulationClock::new(params, &SceneConfig::demo()).unwrap();
        clock.request_fracture(0, vec3f(0., 2.5, 0.), 500.).unwrap();

        {
            let mut exporter = VtkExporter::new(&dir, "test").unwrap();
            exporter.add_snapshot(&clock.latest_snapshot()).unwrap();
            let snapshot = clock.tick().unwrap();
            assert!(!snapshot.fragments.is_empty());
            exporter.add_snapshot(&snapshot).unwrap();
        }

        assert!(dir.join("test-00001.vtk").exists());
        assert!(dir.join("test-00002.vtk").exists());
        let series = std::fs::read_to_string(dir.join("test.vtk.series")).unwrap();
        assert!(series.contains("test-00002.vtk"));
        assert!(series.trim_end().ends_with('}'));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
