//! Plain-text dumps of the scheduler state for debugging.

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
};

use crate::{tile::TileStatus, tile_map::TileMap};

/// Writes every ticket as `x<TAB>z<TAB>kind<TAB>level<TAB>created_at_tick`, one per line.
pub fn dump_tickets(map: &TileMap, path: &Path) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    write_tickets(map, &mut out)?;
    out.flush()
}

fn write_tickets(map: &TileMap, out: &mut impl Write) -> io::Result<()> {
    for (pos, ticket) in map.debug_tickets() {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}",
            pos.x, pos.z, ticket.kind, ticket.level, ticket.created_at_tick
        )?;
    }
    Ok(())
}

/// Writes one CSV row per holder, pending unloads included.
pub fn dump_tiles(map: &TileMap, path: &Path) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    write_tiles(map, &mut out)?;
    out.flush()
}

fn write_tiles(map: &TileMap, out: &mut impl Write) -> io::Result<()> {
    writeln!(
        out,
        "x,z,level,in_memory,status,full_status,accessible_ready,ticking_ready,entity_ticking_ready,queue_level"
    )?;
    for (holder, in_memory) in map.debug_holders() {
        let pos = holder.pos();
        let status = holder.latest_status().map_or("", TileStatus::name);
        writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{}",
            pos.x,
            pos.z,
            holder.ticket_level(),
            in_memory,
            status,
            holder.full_status(),
            matches!(holder.border_future().now(), Some(Ok(_))),
            matches!(holder.ticking_future().now(), Some(Ok(_))),
            matches!(holder.entity_ticking_future().now(), Some(Ok(_))),
            holder.queue_level(),
        )?;
    }
    Ok(())
}
