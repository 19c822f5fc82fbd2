//! # visr_live
//!
//! visr_live computes live colour statistics for an area detector while it is still
//! writing. It follows an HDF5 dataset that another process is appending frames to (in
//! SWMR mode), reduces every new frame to a small statistic and pushes the normalized
//! result to any number of websocket clients as soon as the frame lands on disk.
//!
//! ## Pipeline
//!
//! - A change notification arrives: either a filesystem event on the file being written
//! ([`watcher::FilesystemWatcher`]) or a bluesky stream document published on a STOMP
//! queue ([`watcher::QueueWatcher`]).
//! - The tick worker ([`worker`]) collapses pending notifications into one tick.
//! - The [`coordinator::PipelineCoordinator`] reads every frame appended since the last
//! tick ([`cursor::DatasetCursor`]), reduces each one to a [`reducer::FrameStat`] (the
//! summed intensity of the top, middle and bottom thirds of the frame, plus the total)
//! and normalizes it against the running minimum and maximum of the session
//! ([`normalizer::RunningNormalizer`]).
//! - Each normalized fraction is broadcast to every subscriber ([`hub::SubscriberHub`]) in
//! frame order, followed by an empty array `[]` marking the end of the batch.
//!
//! ## HDF5
//!
//! Reading real files requires the `hdf5` feature, which needs a system HDF5 install
//! (see the hdf5-metno documentation for `HDF5_DIR`). Without it the server still builds
//! and serves, but only the in-memory source is available. Files are opened read-only in
//! SWMR mode and each refresh reloads the dataset extent, so the writer must create the
//! file with the latest file format and start SWMR writing before the reader opens it.
//!
//! ## Configuration
//!
//! The server is configured through a YAML file:
//!
//! ```yml
//! filepath: /dls/b01-1/data/2025/cm40661-1/bluesky
//! filename: 0.hdf
//! dataset_name: entry/instrument/detector/data
//! bind_address: 127.0.0.1:8000
//! notifier: filesystem
//! watch_path: null
//! stomp_address: localhost:5672
//! stomp_login: user
//! stomp_passcode: password
//! stomp_destination: /queue/test
//! stomp_reconnect_secs: 5
//! subscriber_queue_depth: 256
//! log_level: info
//! log_path: visr_live.log
//! open_on_start: false
//! ```
//!
//! `notifier` is one of `filesystem`, `queue`, `both` or `none`. With `none` nothing
//! triggers ticks and the server only answers control requests.
pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod error;
#[cfg(feature = "hdf5")]
pub mod hdf_source;
pub mod hub;
pub mod normalizer;
pub mod reducer;
pub mod server;
pub mod source;
pub mod stomp;
pub mod watcher;
pub mod worker;
