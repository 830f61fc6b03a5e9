use std::{
    fmt::{Display, Formatter},
    sync::OnceLock,
};

use prettytable::{format, row, Table};

use crate::{
    linearizer::UOp,
    ops::{get_info, LazyOp, LazySrc, OpArg},
    schedule::ScheduleItem,
    symbolic::render_shape,
};

fn listing_format() -> &'static format::TableFormat {
    static FORMAT: OnceLock<format::TableFormat> = OnceLock::new();
    FORMAT.get_or_init(|| {
        format::FormatBuilder::new()
            .column_separator(' ')
            .separators(&[format::LinePosition::Title], format::LineSeparator::new('─', ' ', ' ', ' '))
            .padding(0, 1)
            .build()
    })
}

/// A UOp program as a table, one row per uop.
pub struct UOpListing<'a>(pub &'a [UOp]);

impl UOpListing<'_> {
    pub fn table(&self) -> Table {
        let mut table = Table::new();
        table.set_format(*listing_format());
        table.set_titles(row!["#", "uop", "dtype", "vin", "arg"]);
        for u in self.0 {
            let vin: Vec<String> = u.vin.iter().map(ToString::to_string).collect();
            table.add_row(row![
                r->u.num,
                u.kind,
                u.dtype.map(|d| d.to_string()).unwrap_or_default(),
                format!("[{}]", vin.join(", ")),
                u.arg
            ]);
        }
        table
    }
}

impl Display for UOpListing<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.table())
    }
}

/// A schedule as a table, one row per kernel.
pub struct ScheduleListing<'a>(pub &'a [ScheduleItem]);

impl ScheduleListing<'_> {
    pub fn table(&self) -> Table {
        let mut table = Table::new();
        table.set_format(*listing_format());
        table.set_titles(row!["#", "out", "op", "shape", "inputs", "ops", "mem"]);
        for (i, si) in self.0.iter().enumerate() {
            let info = get_info(&si.ast);
            let inputs: Vec<String> = si.inputs.iter().map(ToString::to_string).collect();
            table.add_row(row![
                r->i,
                si.out,
                si.ast.op(),
                render_shape(&info.shape),
                inputs.join(" "),
                r->info.flops,
                r->info.mem_estimate()
            ]);
        }
        table
    }
}

impl Display for ScheduleListing<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.table())
    }
}

fn fmt_tree(op: &LazyOp, depth: usize, f: &mut Formatter<'_>) -> std::fmt::Result {
    let pad = "  ".repeat(depth);
    match op.arg() {
        OpArg::None => writeln!(f, "{pad}{}", op.op())?,
        arg => writeln!(f, "{pad}{} {arg}", op.op())?,
    }
    for src in op.srcs() {
        match src {
            LazySrc::Op(op) => fmt_tree(op, depth + 1, f)?,
            LazySrc::Buffer(b) => writeln!(f, "{pad}  {b}")?,
        }
    }
    Ok(())
}

/// An indented tree, one op per line.
impl Display for LazyOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        fmt_tree(self, 0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dtype::DType,
        ops::{mem_op, BinaryOp, Op},
        shape_tracker::ShapeTracker,
        symbolic::to_nodes,
    };

    #[test]
    fn test_lazyop_tree() {
        let st = ShapeTracker::from_shape(&to_nodes(&[4])).unwrap();
        let ast = LazyOp::new(
            Op::Binary(BinaryOp::Add),
            vec![mem_op(1, DType::Float32, st.clone()).into(), mem_op(2, DType::Float32, st).into()],
            OpArg::None,
        );
        let s = ast.to_string();
        let lines: Vec<&str> = s.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "BinaryOps.ADD");
        assert!(lines[1].starts_with("  BufferOps.MEM"), "{s}");
    }
}
