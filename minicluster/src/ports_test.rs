use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

use anyhow::{Context, Result};

use crate::error::ClusterError;
use crate::ports::{is_reserved, PortAllocator};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[test]
fn reserve_returns_distinct_ports() -> Result<()> {
    let allocator = PortAllocator::new(LOCALHOST);

    let reservations = allocator.reserve(32)?;

    let ports: HashSet<u16> = reservations.iter().map(|res| res.port()).collect();
    assert_eq!(ports.len(), 32, "expected 32 distinct ports, got {}", ports.len());
    for res in reservations.iter() {
        assert!(res.port() != 0, "expected a concrete port, got 0");
        assert_eq!(res.addr().ip(), LOCALHOST, "expected reservation on {}, got {}", LOCALHOST, res.addr().ip());
        assert!(is_reserved(&res.addr()), "expected {} to be recorded as reserved", res.addr());
    }

    Ok(())
}

#[test]
fn concurrent_reservations_never_overlap() -> Result<()> {
    let allocator = PortAllocator::new(LOCALHOST);

    let first = allocator.reserve(16)?;
    let second = allocator.reserve(16)?;

    let first_ports: HashSet<u16> = first.iter().map(|res| res.port()).collect();
    let overlap: Vec<u16> = second.iter().map(|res| res.port()).filter(|port| first_ports.contains(port)).collect();
    assert!(overlap.is_empty(), "expected no overlap between live reservations, got {:?}", overlap);

    Ok(())
}

#[test]
fn dropping_a_reservation_releases_it() -> Result<()> {
    let allocator = PortAllocator::new(LOCALHOST);
    let mut reservations = allocator.reserve(2)?;
    let released = reservations.pop().context("expected a reservation")?;
    let kept = reservations.pop().context("expected a reservation")?;
    let (released_addr, kept_addr) = (released.addr(), kept.addr());

    released.release();

    assert!(!is_reserved(&released_addr), "expected {} to be released", released_addr);
    assert!(is_reserved(&kept_addr), "expected {} to remain reserved", kept_addr);

    Ok(())
}

#[test]
fn reserve_zero_ports_is_a_noop() -> Result<()> {
    let reservations = PortAllocator::new(LOCALHOST).reserve(0)?;
    assert!(reservations.is_empty(), "expected no reservations, got {}", reservations.len());
    Ok(())
}

#[test]
fn reserve_fails_with_resource_exhausted_when_out_of_attempts() {
    let allocator = PortAllocator::new(LOCALHOST).with_attempts_per_port(0);

    let res = allocator.reserve(3);

    let err = match res {
        Ok(reservations) => panic!("expected an error, got {} reservations", reservations.len()),
        Err(err) => err,
    };
    assert!(
        matches!(err.downcast_ref::<ClusterError>(), Some(ClusterError::ResourceExhausted(_))),
        "expected ResourceExhausted, got {:?}",
        err
    );
}

#[test]
fn reserve_rejects_more_ports_than_exist() {
    let res = PortAllocator::new(LOCALHOST).reserve(usize::MAX / 4);

    let err = match res {
        Ok(reservations) => panic!("expected an error, got {} reservations", reservations.len()),
        Err(err) => err,
    };
    assert!(
        matches!(err.downcast_ref::<ClusterError>(), Some(ClusterError::ResourceExhausted(_))),
        "expected ResourceExhausted, got {:?}",
        err
    );
}
