// @generated by build.rs — DO NOT EDIT
use super::Entry;
pub(crate) const ASC_ASCQ: &[Entry] = &[
    Entry { code: 0x0000, desc: "NO ADDITIONAL SENSE INFORMATION" },
    Entry { code: 0x0001, desc: "FILEMARK DETECTED" },
    Entry { code: 0x0002, desc: "END-OF-PARTITION/MEDIUM DETECTED" },
    Entry { code: 0x0004, desc: "BEGINNING-OF-PARTITION/MEDIUM DETECTED" },
    Entry { code: 0x0006, desc: "I/O PROCESS TERMINATED" },
    Entry { code: 0x0011, desc: "AUDIO PLAY OPERATION IN PROGRESS" },
    Entry { code: 0x0012, desc: "AUDIO PLAY OPERATION PAUSED" },
    Entry { code: 0x0013, desc: "AUDIO PLAY OPERATION SUCCESSFULLY COMPLETED" },
    Entry { code: 0x0014, desc: "AUDIO PLAY OPERATION STOPPED DUE TO ERROR" },
    Entry { code: 0x0016, desc: "OPERATION IN PROGRESS" },
    Entry { code: 0x0017, desc: "CLEANING REQUESTED" },
    Entry { code: 0x0100, desc: "NO INDEX/SECTOR SIGNAL" },
    Entry { code: 0x0200, desc: "NO SEEK COMPLETE" },
    Entry { code: 0x0300, desc: "PERIPHERAL DEVICE WRITE FAULT" },
    Entry { code: 0x0400, desc: "LOGICAL UNIT NOT READY, CAUSE NOT REPORTABLE" },
    Entry { code: 0x0401, desc: "LOGICAL UNIT IS IN PROCESS OF BECOMING READY" },
    Entry { code: 0x0402, desc: "LOGICAL UNIT NOT READY, INITIALIZING COMMAND REQUIRED" },
    Entry { code: 0x0403, desc: "LOGICAL UNIT NOT READY, MANUAL INTERVENTION REQUIRED" },
    Entry { code: 0x0404, desc: "LOGICAL UNIT NOT READY, FORMAT IN PROGRESS" },
    Entry { code: 0x0409, desc: "LOGICAL UNIT NOT READY, SELF-TEST IN PROGRESS" },
    Entry { code: 0x040A, desc: "LOGICAL UNIT NOT ACCESSIBLE, ASYMMETRIC ACCESS STATE TRANSITION" },
    Entry { code: 0x040B, desc: "LOGICAL UNIT NOT ACCESSIBLE, TARGET PORT IN STANDBY STATE" },
    Entry { code: 0x040C, desc: "LOGICAL UNIT NOT ACCESSIBLE, TARGET PORT IN UNAVAILABLE STATE" },
    Entry { code: 0x0500, desc: "LOGICAL UNIT DOES NOT RESPOND TO SELECTION" },
    Entry { code: 0x0600, desc: "NO REFERENCE POSITION FOUND" },
    Entry { code: 0x0700, desc: "MULTIPLE PERIPHERAL DEVICES SELECTED" },
    Entry { code: 0x0800, desc: "LOGICAL UNIT COMMUNICATION FAILURE" },
    Entry { code: 0x0801, desc: "LOGICAL UNIT COMMUNICATION TIME-OUT" },
    Entry { code: 0x0802, desc: "LOGICAL UNIT COMMUNICATION PARITY ERROR" },
    Entry { code: 0x0803, desc: "LOGICAL UNIT COMMUNICATION CRC ERROR" },
    Entry { code: 0x0900, desc: "TRACK FOLLOWING ERROR" },
    Entry { code: 0x0A00, desc: "ERROR LOG OVERFLOW" },
    Entry { code: 0x0B00, desc: "WARNING" },
    Entry { code: 0x0B01, desc: "WARNING - SPECIFIED TEMPERATURE EXCEEDED" },
    Entry { code: 0x0B02, desc: "WARNING - ENCLOSURE DEGRADED" },
    Entry { code: 0x0C00, desc: "WRITE ERROR" },
    Entry { code: 0x0C01, desc: "WRITE ERROR - RECOVERED WITH AUTO REALLOCATION" },
    Entry { code: 0x0C02, desc: "WRITE ERROR - AUTO REALLOCATION FAILED" },
    Entry { code: 0x0C08, desc: "WRITE ERROR - PADDING BLOCKS ADDED" },
    Entry { code: 0x1000, desc: "ID CRC OR ECC ERROR" },
    Entry { code: 0x1100, desc: "UNRECOVERED READ ERROR" },
    Entry { code: 0x1101, desc: "READ RETRIES EXHAUSTED" },
    Entry { code: 0x1102, desc: "ERROR TOO LONG TO CORRECT" },
    Entry { code: 0x110B, desc: "UNRECOVERED READ ERROR - RECOMMEND REASSIGNMENT" },
    Entry { code: 0x110C, desc: "UNRECOVERED READ ERROR - RECOMMEND REWRITE THE DATA" },
    Entry { code: 0x1200, desc: "ADDRESS MARK NOT FOUND FOR ID FIELD" },
    Entry { code: 0x1300, desc: "ADDRESS MARK NOT FOUND FOR DATA FIELD" },
    Entry { code: 0x1400, desc: "RECORDED ENTITY NOT FOUND" },
    Entry { code: 0x1500, desc: "RANDOM POSITIONING ERROR" },
    Entry { code: 0x1600, desc: "DATA SYNCHRONIZATION MARK ERROR" },
    Entry { code: 0x1700, desc: "RECOVERED DATA WITH NO ERROR CORRECTION APPLIED" },
    Entry { code: 0x1701, desc: "RECOVERED DATA WITH RETRIES" },
    Entry { code: 0x1800, desc: "RECOVERED DATA WITH ERROR CORRECTION APPLIED" },
    Entry { code: 0x1900, desc: "DEFECT LIST ERROR" },
    Entry { code: 0x1A00, desc: "PARAMETER LIST LENGTH ERROR" },
    Entry { code: 0x1B00, desc: "SYNCHRONOUS DATA TRANSFER ERROR" },
    Entry { code: 0x1C00, desc: "DEFECT LIST NOT FOUND" },
    Entry { code: 0x1D00, desc: "MISCOMPARE DURING VERIFY OPERATION" },
    Entry { code: 0x1E00, desc: "RECOVERED ID WITH ECC CORRECTION" },
    Entry { code: 0x2000, desc: "INVALID COMMAND OPERATION CODE" },
    Entry { code: 0x2100, desc: "LOGICAL BLOCK ADDRESS OUT OF RANGE" },
    Entry { code: 0x2101, desc: "INVALID ELEMENT ADDRESS" },
    Entry { code: 0x2400, desc: "INVALID FIELD IN CDB" },
    Entry { code: 0x2500, desc: "LOGICAL UNIT NOT SUPPORTED" },
    Entry { code: 0x2600, desc: "INVALID FIELD IN PARAMETER LIST" },
    Entry { code: 0x2601, desc: "PARAMETER NOT SUPPORTED" },
    Entry { code: 0x2602, desc: "PARAMETER VALUE INVALID" },
    Entry { code: 0x2900, desc: "POWER ON, RESET, OR BUS DEVICE RESET OCCURRED" },
    Entry { code: 0x2901, desc: "POWER ON OCCURRED" },
    Entry { code: 0x2902, desc: "SCSI BUS RESET OCCURRED" },
    Entry { code: 0x2903, desc: "BUS DEVICE RESET FUNCTION OCCURRED" },
    Entry { code: 0x2904, desc: "DEVICE INTERNAL RESET" },
    Entry { code: 0x2905, desc: "TRANSCEIVER MODE CHANGED TO SINGLE-ENDED" },
    Entry { code: 0x2A00, desc: "PARAMETERS CHANGED" },
    Entry { code: 0x2A01, desc: "MODE PARAMETERS CHANGED" },
    Entry { code: 0x2A09, desc: "CAPACITY DATA HAS CHANGED" },
    Entry { code: 0x2F00, desc: "COMMANDS CLEARED BY ANOTHER INITIATOR" },
    Entry { code: 0x3000, desc: "INCOMPATIBLE MEDIUM INSTALLED" },
    Entry { code: 0x3100, desc: "MEDIUM FORMAT CORRUPTED" },
    Entry { code: 0x3101, desc: "FORMAT COMMAND FAILED" },
    Entry { code: 0x3200, desc: "NO DEFECT SPARE LOCATION AVAILABLE" },
    Entry { code: 0x3600, desc: "RIBBON, INK, OR TONER FAILURE" },
    Entry { code: 0x3700, desc: "ROUNDED PARAMETER" },
    Entry { code: 0x3900, desc: "SAVING PARAMETERS NOT SUPPORTED" },
    Entry { code: 0x3A00, desc: "MEDIUM NOT PRESENT" },
    Entry { code: 0x3A01, desc: "MEDIUM NOT PRESENT - TRAY CLOSED" },
    Entry { code: 0x3A02, desc: "MEDIUM NOT PRESENT - TRAY OPEN" },
    Entry { code: 0x3D00, desc: "INVALID BITS IN IDENTIFY MESSAGE" },
    Entry { code: 0x3E00, desc: "LOGICAL UNIT HAS NOT SELF-CONFIGURED YET" },
    Entry { code: 0x3F00, desc: "TARGET OPERATING CONDITIONS HAVE CHANGED" },
    Entry { code: 0x3F01, desc: "MICROCODE HAS BEEN CHANGED" },
    Entry { code: 0x3F02, desc: "CHANGED OPERATING DEFINITION" },
    Entry { code: 0x3F03, desc: "INQUIRY DATA HAS CHANGED" },
    Entry { code: 0x3F0E, desc: "REPORTED LUNS DATA HAS CHANGED" },
    Entry { code: 0x4300, desc: "MESSAGE ERROR" },
    Entry { code: 0x4400, desc: "INTERNAL TARGET FAILURE" },
    Entry { code: 0x4500, desc: "SELECT OR RESELECT FAILURE" },
    Entry { code: 0x4700, desc: "SCSI PARITY ERROR" },
    Entry { code: 0x4800, desc: "INITIATOR DETECTED ERROR MESSAGE RECEIVED" },
    Entry { code: 0x4900, desc: "INVALID MESSAGE ERROR" },
    Entry { code: 0x4A00, desc: "COMMAND PHASE ERROR" },
    Entry { code: 0x4B00, desc: "DATA PHASE ERROR" },
    Entry { code: 0x4C00, desc: "LOGICAL UNIT FAILED SELF-CONFIGURATION" },
    Entry { code: 0x5300, desc: "MEDIA LOAD OR EJECT FAILED" },
    Entry { code: 0x5301, desc: "UNLOAD TAPE FAILURE" },
    Entry { code: 0x5302, desc: "MEDIUM REMOVAL PREVENTED" },
    Entry { code: 0x5500, desc: "SYSTEM RESOURCE FAILURE" },
    Entry { code: 0x5501, desc: "SYSTEM BUFFER FULL" },
    Entry { code: 0x5A00, desc: "OPERATOR REQUEST OR STATE CHANGE INPUT" },
    Entry { code: 0x5A01, desc: "OPERATOR MEDIUM REMOVAL REQUEST" },
    Entry { code: 0x5C00, desc: "RPL STATUS CHANGE" },
    Entry { code: 0x5D00, desc: "FAILURE PREDICTION THRESHOLD EXCEEDED" },
    Entry { code: 0x6300, desc: "END OF USER AREA ENCOUNTERED ON THIS TRACK" },
    Entry { code: 0x6700, desc: "CONFIGURATION FAILURE" },
    Entry { code: 0x6800, desc: "LOGICAL UNIT NOT CONFIGURED" },
    Entry { code: 0x6F00, desc: "COPY PROTECTION KEY EXCHANGE FAILURE - AUTHENTICATION FAILURE" },
    Entry { code: 0x7200, desc: "SESSION FIXATION ERROR" },
    Entry { code: 0x7400, desc: "SECURITY ERROR" },
    Entry { code: 0x7401, desc: "UNABLE TO DECRYPT DATA" },
    Entry { code: 0x7402, desc: "UNENCRYPTED DATA ENCOUNTERED WHILE DECRYPTING" },
];
