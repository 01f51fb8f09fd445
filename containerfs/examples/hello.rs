use containerfs::{FileBlockEmulatorBuilder, Geometry, Volume};

pub fn main() {
    let tmp = tempfile::tempfile().unwrap();
    let geometry = Geometry::new(64, 4096, 4096 + 64 * 256).unwrap();
    let dev = FileBlockEmulatorBuilder::from(tmp)
        .with_geometry(geometry)
        .build()
        .expect("Could not initialize container.");

    // format a new volume on the container and write a file
    let mut volume = Volume::format(dev).expect("should format");
    volume.create("/dir/a.txt").unwrap();
    let handle = volume.open("/dir/a.txt", "w+").unwrap();
    volume.write(handle, b"hello world", Some(0)).unwrap();

    let head = volume.read(handle, Some(0), Some(5)).unwrap();
    println!("{}", String::from_utf8_lossy(&head));

    volume.truncate(handle, 5).unwrap();
    for report in volume.describe_open_handles() {
        println!("{:?}", report);
    }
    volume.close(handle).unwrap();
    volume.delete_file("/dir/a.txt").unwrap();
    println!("{} blocks free", volume.free_blocks());
}
