//! Offline reduction of persisted measurement records.
//!
//! A [`ResultTable`] is built from the [`RawSample`]s of a record file and
//! pivots them into one row per iteration and CPU, with one column per event.
//! Derived rates such as IPC are appended as extra columns by
//! [`ResultTable::with_rates`].

use std::{collections::BTreeMap, fmt};

use log::debug;
use tabled::{
    builder::Builder,
    settings::{object::Columns, Alignment, Style},
};

use crate::{
    catalog::EventName,
    cpu::CpuId,
    error::{new_error, Error, ErrorKind},
    rate::rate,
    sample::RawSample,
};

/// The values of one (iteration, CPU) row, by column name.
pub type Row = BTreeMap<EventName, f64>;

/// Floating point operations per count of each `fp_arith_inst_retired` (and
/// `fp_assist`) event, for use with [`ResultTable::weighted_total`].
pub const FP_OPERATION_WEIGHTS: &[(&str, f64)] = &[
    ("fp_arith_inst_retired.128b_packed_double", 2.0),
    ("fp_arith_inst_retired.128b_packed_single", 4.0),
    ("fp_arith_inst_retired.256b_packed_double", 4.0),
    ("fp_arith_inst_retired.256b_packed_single", 8.0),
    ("fp_arith_inst_retired.512b_packed_double", 8.0),
    ("fp_arith_inst_retired.512b_packed_single", 16.0),
    ("fp_arith_inst_retired.scalar_double", 1.0),
    ("fp_arith_inst_retired.scalar_single", 1.0),
    ("fp_assist.any", 1.0),
];

/// A named ratio of two event columns.
///
/// Each operand lists one or more candidate event names, so the same metric
/// can be computed whichever naming scheme the events were recorded with;
/// the first candidate present in the table is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedMetric {
    name: String,
    dividend: Vec<EventName>,
    divisor: Vec<EventName>,
}

impl DerivedMetric {
    pub fn new(
        name: impl Into<String>,
        dividend: impl Into<EventName>,
        divisor: impl Into<EventName>,
    ) -> Self {
        DerivedMetric {
            name: name.into(),
            dividend: vec![dividend.into()],
            divisor: vec![divisor.into()],
        }
    }

    /// A metric whose operands may each be recorded under any of several
    /// names, in order of preference.
    pub fn with_aliases(name: impl Into<String>, dividend: &[&str], divisor: &[&str]) -> Self {
        DerivedMetric {
            name: name.into(),
            dividend: dividend.iter().map(|s| s.to_string()).collect(),
            divisor: divisor.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instructions per cycle.
    pub fn ipc() -> Self {
        Self::with_aliases(
            "IPC",
            &[
                "instructions",
                "PAPI_TOT_INS",
                "PERF_COUNT_HW_INSTRUCTIONS",
                "INSTRUCTION_RETIRED",
            ],
            &["cycles", "PAPI_TOT_CYC", "PERF_COUNT_HW_CPU_CYCLES"],
        )
    }

    pub fn branch_miss_rate() -> Self {
        Self::with_aliases(
            "Branch miss rate",
            &[
                "branch-misses",
                "PAPI_BR_MSP",
                "PERF_COUNT_HW_BRANCH_MISSES",
                "MISPREDICTED_BRANCH_RETIRED",
            ],
            &[
                "branch-instructions",
                "PAPI_BR_CN",
                "BRANCHES",
                "BRANCH_INSTRUCTIONS_RETIRED",
                "PERF_COUNT_HW_BRANCH_INSTRUCTIONS",
            ],
        )
    }

    pub fn cache_miss_rate() -> Self {
        Self::with_aliases(
            "Cache miss rate",
            &["cache-misses", "PERF_COUNT_HW_CACHE_MISSES"],
            &["cache-references", "PERF_COUNT_HW_CACHE_REFERENCES"],
        )
    }

    pub fn l1d_miss_rate() -> Self {
        Self::with_aliases(
            "L1 Data cache miss rate",
            &["PAPI_L1_DCM", "PERF_COUNT_HW_CACHE_L1D.MISS"],
            &["PERF_COUNT_HW_CACHE_L1D.ACCESS"],
        )
    }

    pub fn l1i_miss_rate() -> Self {
        Self::with_aliases(
            "L1 Inst cache miss rate",
            &["PAPI_L1_ICM", "PERF_COUNT_HW_CACHE_L1I.MISS"],
            &["PERF_COUNT_HW_CACHE_L1I.ACCESS"],
        )
    }

    /// Every built-in metric.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::ipc(),
            Self::branch_miss_rate(),
            Self::cache_miss_rate(),
            Self::l1d_miss_rate(),
            Self::l1i_miss_rate(),
        ]
    }

    /// The first dividend and divisor candidates present in `columns`.
    fn operands<'a>(&self, columns: &'a [EventName]) -> Option<(&'a str, &'a str)> {
        let find = |candidates: &[EventName]| {
            candidates
                .iter()
                .find_map(|c| columns.iter().find(|col| *col == c))
                .map(String::as_str)
        };
        Some((find(&self.dividend)?, find(&self.divisor)?))
    }
}

/// One row of [`ResultTable::as_sequence`].
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub iteration: u32,
    pub cpu: CpuId,
    /// One value per [`ResultTable::columns`] entry, in the same order.
    pub values: Vec<f64>,
}

/// Measurement records pivoted to `(iteration, cpu) -> event -> value`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultTable {
    columns: Vec<EventName>,
    events: usize,
    cpus: Vec<CpuId>,
    iterations: u32,
    rows: BTreeMap<(u32, CpuId), Row>,
}

impl ResultTable {
    /// Group `records` into iterations.
    ///
    /// Records carry no iteration number: the events are the distinct event
    /// names and the CPUs the distinct CPUs of `records`, and every
    /// consecutive run of `|events| x |cpus|` records is one iteration.
    /// Within an iteration the records may come in any order, but every
    /// (cpu, event) pair must appear exactly once.
    ///
    /// ```
    /// use pmc_session::{RawSample, ResultTable};
    ///
    /// let records = vec![
    ///     RawSample::new(0, 100, None, "cycles"),
    ///     RawSample::new(0, 150, None, "instructions"),
    ///     RawSample::new(0, 200, None, "cycles"),
    ///     RawSample::new(0, 100, None, "instructions"),
    /// ];
    ///
    /// let table = ResultTable::from_records(&records)?;
    /// assert_eq!(table.iterations(), 2);
    /// assert_eq!(table.value(1, 0, "cycles"), Some(200.0));
    /// #
    /// # Ok::<(), pmc_session::Error>(())
    /// ```
    pub fn from_records(records: &[RawSample]) -> Result<Self, Error> {
        let mut columns: Vec<EventName> = Vec::new();
        let mut cpus: Vec<CpuId> = Vec::new();
        for r in records {
            if !columns.contains(&r.event) {
                columns.push(r.event.clone());
            }
            if !cpus.contains(&r.cpu) {
                cpus.push(r.cpu);
            }
        }
        cpus.sort_unstable();

        let chunk = columns.len() * cpus.len();
        if chunk == 0 {
            return Ok(ResultTable::default());
        }
        if records.len() % chunk != 0 {
            return Err(new_error(ErrorKind::MalformedInput(format!(
                "{} records do not divide into iterations of {} events on {} cpus",
                records.len(),
                columns.len(),
                cpus.len()
            ))));
        }

        // Each chunk holds exactly |events| x |cpus| records, so with no
        // duplicate pair every pair is present.
        let mut rows = BTreeMap::new();
        for (iteration, chunk) in records.chunks(chunk).enumerate() {
            let iteration = iteration as u32;
            for r in chunk {
                let row: &mut Row = rows.entry((iteration, r.cpu)).or_default();
                if row.insert(r.event.clone(), r.value as f64).is_some() {
                    return Err(new_error(ErrorKind::MalformedInput(format!(
                        "iteration {} has more than one {} record for cpu {}",
                        iteration, r.event, r.cpu
                    ))));
                }
            }
        }

        let iterations = (records.len() / chunk) as u32;
        debug!(
            "{} records pivoted into {} iterations of {} events on {} cpus",
            records.len(),
            iterations,
            columns.len(),
            cpus.len()
        );

        Ok(ResultTable {
            events: columns.len(),
            columns,
            cpus,
            iterations,
            rows,
        })
    }

    /// The pivoted values.
    pub fn pivot(&self) -> &BTreeMap<(u32, CpuId), Row> {
        &self.rows
    }

    /// The table as a mapping of `(iteration, cpu)` to the row values.
    pub fn as_mapping(&self) -> &BTreeMap<(u32, CpuId), Row> {
        self.pivot()
    }

    /// The table as rows ordered by iteration then CPU, each holding its
    /// values in [`columns`](ResultTable::columns) order.
    pub fn as_sequence(&self) -> Vec<TableRow> {
        self.rows
            .iter()
            .map(|(&(iteration, cpu), row)| TableRow {
                iteration,
                cpu,
                values: self
                    .columns
                    .iter()
                    .map(|c| row.get(c).copied().unwrap_or(0.0))
                    .collect(),
            })
            .collect()
    }

    /// A copy of this table with one extra column per metric of `defs`.
    ///
    /// A metric is left out when one of its operands was not measured, or
    /// when a column of the same name already exists. Where the divisor is
    /// zero the metric is `0`.
    pub fn with_rates(&self, defs: &[DerivedMetric]) -> Result<ResultTable, Error> {
        let mut table = self.clone();

        for def in defs {
            if table.columns.iter().any(|c| c == def.name()) {
                debug!("column {:?} already present", def.name());
                continue;
            }
            let (dividend, divisor) = match def.operands(&table.columns[..table.events]) {
                Some(ops) => ops,
                None => {
                    debug!("{} not computed, operands not measured", def.name());
                    continue;
                }
            };

            let a = table.column_values(dividend);
            let b = table.column_values(divisor);
            let values = rate(&a, &b)?;

            for ((row, v), d) in table.rows.values_mut().zip(values).zip(b) {
                let v = if d == 0.0 { 0.0 } else { v };
                row.insert(def.name().to_string(), v);
            }
            table.columns.push(def.name().to_string());
        }

        Ok(table)
    }

    /// The number of iterations.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// The CPUs, in ascending order.
    pub fn cpus(&self) -> &[CpuId] {
        &self.cpus
    }

    /// Every column: the events in the order first recorded, then any
    /// derived metrics.
    pub fn columns(&self) -> &[EventName] {
        &self.columns
    }

    /// The event columns only.
    pub fn events(&self) -> &[EventName] {
        &self.columns[..self.events]
    }

    pub fn value(&self, iteration: u32, cpu: CpuId, column: &str) -> Option<f64> {
        self.rows.get(&(iteration, cpu))?.get(column).copied()
    }

    /// Every row of `cpu`, by iteration.
    pub fn rows_for_cpu(&self, cpu: CpuId) -> impl Iterator<Item = (u32, &Row)> + '_ {
        self.rows
            .iter()
            .filter(move |((_, c), _)| *c == cpu)
            .map(|((i, _), row)| (*i, row))
    }

    /// The values of `column` in row order, zero where missing.
    fn column_values(&self, column: &str) -> Vec<f64> {
        self.rows
            .values()
            .map(|row| row.get(column).copied().unwrap_or(0.0))
            .collect()
    }

    /// The sum of each event over every iteration and CPU, in column order.
    pub fn event_totals(&self) -> Vec<(EventName, f64)> {
        self.events()
            .iter()
            .map(|e| (e.clone(), self.column_values(e).iter().sum()))
            .collect()
    }

    /// The sum of `weight x total` over the weighted events that were
    /// measured, or `None` if none of them were.
    ///
    /// With [`FP_OPERATION_WEIGHTS`] this is the total number of floating
    /// point operations.
    pub fn weighted_total(&self, weights: &[(&str, f64)]) -> Option<f64> {
        let totals = self.event_totals();
        let mut found = false;
        let mut sum = 0.0;
        for &(event, weight) in weights {
            if let Some((_, total)) = totals.iter().find(|(e, _)| e == event) {
                found = true;
                sum += weight * total;
            }
        }
        if found {
            Some(sum)
        } else {
            None
        }
    }
}

fn format_value(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{:.0}", v)
    } else {
        format!("{:.4}", v)
    }
}

impl fmt::Display for ResultTable {
    /// Prints one line per row, with a header line naming the columns.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = Builder::new();

        let mut header = vec!["iteration".to_string(), "cpu".to_string()];
        header.extend(self.columns.iter().cloned());
        builder.push_record(header);

        for row in self.as_sequence() {
            let mut cells = vec![row.iteration.to_string(), row.cpu.to_string()];
            cells.extend(row.values.into_iter().map(format_value));
            builder.push_record(cells);
        }

        let mut table = builder.build();
        table
            .with(Style::psql())
            .modify(Columns::new(..), Alignment::right());
        writeln!(f, "{}", table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(values: &[(CpuId, i64, &str)]) -> Vec<RawSample> {
        values
            .iter()
            .map(|&(cpu, v, e)| RawSample::new(cpu, v, None, e))
            .collect()
    }

    #[test]
    fn test_from_records_two_iterations() {
        let table = ResultTable::from_records(&records(&[
            (0, 100, "cycles"),
            (0, 50, "instructions"),
            (1, 200, "cycles"),
            (1, 80, "instructions"),
            (1, 300, "cycles"),
            (0, 110, "cycles"),
            (1, 90, "instructions"),
            (0, 55, "instructions"),
        ]))
        .unwrap();

        assert_eq!(table.iterations(), 2);
        assert_eq!(table.cpus(), &[0, 1]);
        assert_eq!(table.columns(), &["cycles", "instructions"]);
        assert_eq!(table.value(0, 1, "instructions"), Some(80.0));
        assert_eq!(table.value(1, 0, "cycles"), Some(110.0));
        assert_eq!(table.value(2, 0, "cycles"), None);

        let cpu1: Vec<u32> = table.rows_for_cpu(1).map(|(i, _)| i).collect();
        assert_eq!(cpu1, vec![0, 1]);
    }

    #[test]
    fn test_from_records_incomplete_iteration() {
        let err = ResultTable::from_records(&records(&[
            (0, 1, "cycles"),
            (0, 1, "instructions"),
            (0, 1, "cycles"),
        ]))
        .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::MalformedInput(_)));
    }

    #[test]
    fn test_from_records_duplicate_pair() {
        // Four records for 2 events x 2 cpus, but cpu 1 has no instructions
        let err = ResultTable::from_records(&records(&[
            (0, 1, "cycles"),
            (0, 1, "instructions"),
            (1, 1, "cycles"),
            (1, 1, "cycles"),
        ]))
        .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::MalformedInput(_)));
    }

    #[test]
    fn test_from_records_empty() {
        let table = ResultTable::from_records(&[]).unwrap();
        assert_eq!(table.iterations(), 0);
        assert!(table.as_sequence().is_empty());
    }

    #[test]
    fn test_ipc_absent_without_operand() {
        let table = ResultTable::from_records(&records(&[(0, 100, "cycles")])).unwrap();
        let table = table.with_rates(&[DerivedMetric::ipc()]).unwrap();

        assert_eq!(table.columns(), &["cycles"]);
        assert_eq!(table.value(0, 0, "IPC"), None);
    }

    #[test]
    fn test_ipc_zero_cycles() {
        let table = ResultTable::from_records(&records(&[
            (0, 0, "cycles"),
            (0, 500, "instructions"),
            (1, 250, "cycles"),
            (1, 500, "instructions"),
        ]))
        .unwrap()
        .with_rates(&DerivedMetric::defaults())
        .unwrap();

        assert_eq!(table.columns(), &["cycles", "instructions", "IPC"]);
        assert_eq!(table.value(0, 0, "IPC"), Some(0.0));
        assert_eq!(table.value(0, 1, "IPC"), Some(2.0));
    }

    #[test]
    fn test_rate_aliases() {
        let table = ResultTable::from_records(&records(&[
            (0, 10, "PAPI_BR_MSP"),
            (0, 100, "PERF_COUNT_HW_BRANCH_INSTRUCTIONS"),
        ]))
        .unwrap()
        .with_rates(&[DerivedMetric::branch_miss_rate()])
        .unwrap();

        assert_eq!(table.value(0, 0, "Branch miss rate"), Some(0.1));
    }

    #[test]
    fn test_rate_skips_existing_column() {
        let table = ResultTable::from_records(&records(&[
            (0, 10, "a"),
            (0, 5, "b"),
            (0, 7, "IPC"),
        ]))
        .unwrap()
        .with_rates(&[DerivedMetric::new("IPC", "a", "b")])
        .unwrap();

        assert_eq!(table.value(0, 0, "IPC"), Some(7.0));
        assert_eq!(table.columns().len(), 3);
    }

    #[test]
    fn test_as_sequence_column_order() {
        let table = ResultTable::from_records(&records(&[
            (1, 4, "instructions"),
            (1, 2, "cycles"),
            (0, 3, "instructions"),
            (0, 1, "cycles"),
        ]))
        .unwrap()
        .with_rates(&[DerivedMetric::ipc()])
        .unwrap();

        let rows = table.as_sequence();
        assert_eq!(
            rows,
            vec![
                TableRow {
                    iteration: 0,
                    cpu: 0,
                    values: vec![3.0, 1.0, 3.0],
                },
                TableRow {
                    iteration: 0,
                    cpu: 1,
                    values: vec![4.0, 2.0, 2.0],
                },
            ]
        );
        assert_eq!(table.as_mapping().len(), 2);
    }

    #[test]
    fn test_totals() {
        let table = ResultTable::from_records(&records(&[
            (0, 10, "fp_arith_inst_retired.scalar_double"),
            (0, 3, "fp_arith_inst_retired.256b_packed_double"),
            (1, 5, "fp_arith_inst_retired.scalar_double"),
            (1, 1, "fp_arith_inst_retired.256b_packed_double"),
        ]))
        .unwrap();

        assert_eq!(
            table.event_totals(),
            vec![
                ("fp_arith_inst_retired.scalar_double".to_string(), 15.0),
                ("fp_arith_inst_retired.256b_packed_double".to_string(), 4.0),
            ]
        );
        assert_eq!(table.weighted_total(FP_OPERATION_WEIGHTS), Some(31.0));
        assert_eq!(table.weighted_total(&[("cycles", 1.0)]), None);
    }

    #[test]
    fn test_display() {
        let records = records(&[(0, 1000, "cycles"), (0, 250, "instructions")]);
        let table = ResultTable::from_records(&records)
            .unwrap()
            .with_rates(&[DerivedMetric::ipc()])
            .unwrap();

        let out = table.to_string();
        let lines: Vec<&str> = out.lines().collect();

        // Header, rule, one row
        assert_eq!(lines.len(), 3);
        let cells = |line: &str| -> Vec<String> {
            line.split('|').map(|c| c.trim().to_string()).collect()
        };
        assert_eq!(
            cells(lines[0]),
            vec!["iteration", "cpu", "cycles", "instructions", "IPC"]
        );
        assert_eq!(cells(lines[2]), vec!["0", "0", "1000", "250", "0.2500"]);
        assert!(lines.iter().all(|l| l.len() == lines[0].len()));
    }
}
