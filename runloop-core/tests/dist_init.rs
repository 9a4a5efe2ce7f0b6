//! Process-group initialization. Kept in its own test binary because the
//! group is global to the process.

use runloop_core::distributed::{self, DistConfig};
use runloop_core::{DistContext, DistributedError};

#[test]
fn second_init_is_rejected() {
    assert!(!distributed::is_initialized());
    assert_eq!(distributed::current(), DistContext::single());

    let config = DistConfig {
        rank: Some(0),
        world_size: Some(1),
        ..DistConfig::default()
    };
    let ctx = distributed::init_process_group(&config).unwrap();
    assert!(ctx.is_master());
    assert!(distributed::is_initialized());
    assert_eq!(distributed::current(), ctx);

    let err = distributed::init_process_group(&config).unwrap_err();
    assert!(matches!(
        err,
        DistributedError::AlreadyInitialized {
            rank: 0,
            world_size: 1
        }
    ));
}
